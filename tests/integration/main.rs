//! Integration tests: full chase days against a scripted exchange.

mod chase_day;
mod mock_exchange;
