// Exchange access: the pacing gateway and the REST client behind it
pub mod exchange;
pub mod gateway;

pub use exchange::{Exchange, ExchangeClient, OrderReport};
pub use gateway::Gateway;
