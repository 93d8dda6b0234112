pub mod cache;
pub mod dispatch;
pub mod icons;
pub mod poller;
pub mod queue;
pub mod service;

#[cfg(test)]
mod testing;
