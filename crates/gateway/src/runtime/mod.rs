pub mod agents;
pub mod chat_queue;
pub mod coalesce;
pub mod tools;
pub mod turn;
