//! Integration tests: full trading flows over an in-memory brokerage and
//! over the REST client against a local mock server.

mod kis_flow;
mod mock_broker;
mod trading_flow;
