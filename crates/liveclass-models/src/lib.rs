pub mod gateway;
pub mod poll;
pub mod presence;
