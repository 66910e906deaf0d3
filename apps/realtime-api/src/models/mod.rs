pub mod booking;
pub mod message;
pub mod notification;
pub mod role;
