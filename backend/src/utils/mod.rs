//! Collection of general utility functions shared by the services.

pub mod crypto;
pub mod jwt;
pub mod random;
pub mod retry;
pub mod unsubscribe;
