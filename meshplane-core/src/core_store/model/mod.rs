/*
    Model subsystem - Account aggregate and the entities it owns
*/

pub mod account;
pub mod group;
pub mod nameserver;
pub mod peer;
pub mod policy;
pub mod route;
pub mod setup_key;
pub mod types;
pub mod user;

pub use account::*;
pub use group::*;
pub use nameserver::*;
pub use peer::*;
pub use policy::*;
pub use route::*;
pub use setup_key::*;
pub use types::*;
pub use user::*;
