pub mod subscriber;

pub use subscriber::NatsSubscriber;
