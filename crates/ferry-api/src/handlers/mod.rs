pub mod copy_status;
pub mod health;
pub mod trace;
pub mod uploads;
