extern crate bincode;
extern crate config;
extern crate env_logger;
#[macro_use]
extern crate log;
extern crate net2;
extern crate rand;
extern crate serde;
#[macro_use]
extern crate serde_derive;

pub mod lattice;
pub mod codec;
pub mod message;
pub mod transport;
pub mod faleiro;
pub mod generalized;
pub mod zheng;
pub mod coordinator;
pub mod configurations;
