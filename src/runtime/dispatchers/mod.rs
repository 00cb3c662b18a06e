//! Dispatcher loops, one module per queue:
//! - `workflow`: locked message batches through turns
//! - `worker`: activity execution under a renewable peek lock
//! - `timer`: due timer schedules into workflow messages

mod timer;
mod worker;
mod workflow;
