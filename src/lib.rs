pub mod api;
pub mod app;
pub mod config;
pub mod utils;

pub mod clients {
    pub mod broker;
    pub mod health;
    pub mod memory;
    pub mod rbmq;
    pub mod redis;
}

pub mod models {
    pub mod event;
    pub mod health;
    pub mod message;
    pub mod response;
    pub mod retry;
    pub mod stats;
    pub mod status;
}

pub mod services {
    pub mod consumer;
    pub mod dispatcher;
    pub mod producer;
    pub mod redelivery;
    pub mod senders;
    pub mod worker;
}
