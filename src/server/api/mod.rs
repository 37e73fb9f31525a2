// HTTP API handlers, one module per resource

pub mod chat;
pub mod matchmake;
pub mod sessions;
pub mod stream;
