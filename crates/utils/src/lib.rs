pub mod assets;
pub mod logging;
pub mod session;
pub mod storage;
