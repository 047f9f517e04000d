//! Central module for organizing the application's API endpoints outside
//! of the core authentication routes, which live in `auth`.

pub mod common;
pub mod unsubscribe;
