pub mod checker;
pub mod dispatcher;
pub mod retention;
pub mod retry;
pub mod status;
pub mod storage;
pub mod worker;
