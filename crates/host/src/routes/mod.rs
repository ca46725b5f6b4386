pub mod health;
pub mod sagas;
