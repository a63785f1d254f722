pub mod keepalive;
pub mod rest;
pub mod ws;
