//! Transaction-type (TR_ID) tables.
//!
//! Every brokerage call carries a `tr_id` header naming the operation.
//! The code depends on the environment (live ids start with `T`, paper
//! ids with `V`), and for orders on the exchange and direction.

use crate::types::{Environment, Exchange, Side};

/// Quotation TR_ID; identical in both environments.
pub const CURRENT_PRICE: &str = "HHDFS00000300";

fn pick(env: Environment, real: &'static str, mock: &'static str) -> &'static str {
    match env {
        Environment::Real => real,
        Environment::Mock => mock,
    }
}

pub fn domestic_balance(env: Environment) -> &'static str {
    pick(env, "TTTC8434R", "VTTC8434R")
}

pub fn overseas_balance(env: Environment) -> &'static str {
    pick(env, "TTTS3012R", "VTTS3012R")
}

pub fn purchasable_amount(env: Environment) -> &'static str {
    pick(env, "TTTS3007R", "VTTS3007R")
}

pub fn order_history(env: Environment) -> &'static str {
    pick(env, "TTTS3035R", "VTTS3035R")
}

/// Outstanding-order inquiry (live only; the paper server has no NCCS
/// endpoint and callers fall back to `order_history`).
pub const OUTSTANDING_ORDERS: &str = "TTTS3018R";

/// Cash order.
pub fn order(env: Environment, exchange: Exchange, side: Side) -> &'static str {
    use Exchange::*;
    use Side::*;
    match (exchange, side) {
        (Nasd | Nyse | Amex, Buy) => pick(env, "TTTT1002U", "VTTT1002U"),
        // The live and paper sell ids differ in more than the prefix.
        (Nasd | Nyse | Amex, Sell) => pick(env, "TTTT1006U", "VTTT1001U"),
        (Tkse, Buy) => pick(env, "TTTS0308U", "VTTS0308U"),
        (Tkse, Sell) => pick(env, "TTTS0307U", "VTTS0307U"),
        (Shaa, Buy) => pick(env, "TTTS0202U", "VTTS0202U"),
        (Shaa, Sell) => pick(env, "TTTS1005U", "VTTS1005U"),
        (Sehk, Buy) => pick(env, "TTTS1002U", "VTTS1002U"),
        (Sehk, Sell) => pick(env, "TTTS1001U", "VTTS1001U"),
        (Szaa, Buy) => pick(env, "TTTS0305U", "VTTS0305U"),
        (Szaa, Sell) => pick(env, "TTTS0304U", "VTTS0304U"),
        (Hase | Vnse, Buy) => pick(env, "TTTS0311U", "VTTS0311U"),
        (Hase | Vnse, Sell) => pick(env, "TTTS0310U", "VTTS0310U"),
    }
}

/// TR_ID and optional buy/sell division code for a reservation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationTr {
    pub tr_id: &'static str,
    /// `SLL_BUY_DVSN_CD`: "01" sell, "02" buy. Only non-US reservations
    /// carry it; US reservations encode direction in the TR_ID.
    pub side_code: Option<&'static str>,
}

pub fn reservation(env: Environment, exchange: Exchange, side: Side) -> ReservationTr {
    if exchange.is_us() {
        let tr_id = match side {
            Side::Buy => pick(env, "TTTT3014U", "VTTT3014U"),
            Side::Sell => pick(env, "TTTT3016U", "VTTT3016U"),
        };
        ReservationTr { tr_id, side_code: None }
    } else {
        ReservationTr {
            tr_id: pick(env, "TTTS3013U", "VTTS3013U"),
            side_code: Some(match side {
                Side::Sell => "01",
                Side::Buy => "02",
            }),
        }
    }
}

/// Reservation-list inquiry. `None` in the paper environment, which does
/// not offer it.
pub fn reservation_list(env: Environment, exchange: Option<Exchange>) -> Option<&'static str> {
    if env.is_mock() {
        return None;
    }
    match exchange {
        None => Some("TTTT3039R"),
        Some(e) if e.is_us() => Some("TTTT3039R"),
        Some(_) => Some("TTTS3014R"),
    }
}
