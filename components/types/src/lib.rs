pub mod journal;
pub mod record;
pub mod request;
