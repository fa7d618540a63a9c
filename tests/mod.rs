mod common;

mod consumer_tests;
mod dispatcher_tests;
mod rabbitmq_tests;
