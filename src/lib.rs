pub mod config;
pub mod contact;
pub mod context;
pub mod conversation;
pub mod crypto;
pub mod identity;
pub mod kep;
pub mod logging;
pub mod protocol;
pub mod queue;
pub mod router;
pub mod runtime;
pub mod scheduler;
pub mod storage;
pub mod transport;
