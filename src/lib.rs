//! Newsroom Board
//!
//! Client core for the newsroom's collaborative lead board and shared calendar. Rows live in
//! a hosted service; every open page keeps a local copy that follows the service's change
//! stream and applies the user's own edits optimistically.

pub mod auth;
pub mod backend;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod models;
pub mod pages;
pub mod realtime;
pub mod reconciler;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod tests;
