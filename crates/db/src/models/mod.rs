pub mod challenge;
pub mod challenge_participant;
pub mod progress_entry;
