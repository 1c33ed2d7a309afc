//! Trade planning
//!
//! Turns a locked `Market` snapshot and a `TradeRequest` into the exact set
//! of writes a store must commit. Pure: stores call this while holding the
//! asset's lock so the curve is never priced against stale reserves.

use rust_decimal::Decimal;

use crate::config::CurveConfig;
use crate::core_types::{Address, AssetUnits, Lamports};
use crate::curve::{Fill, Reserves, quote_buy, quote_sell};
use crate::error::MarketError;
use crate::fee::FeeRole;
use crate::graduation::state::Lifecycle;
use crate::models::{Direction, FeeDistribution, Market, SettledTrade, Trade, TradeRequest};

/// Per-engine constants every plan needs.
#[derive(Debug, Clone)]
pub struct SettlementContext {
    pub curve: CurveConfig,
    pub treasury: Address,
}

impl SettlementContext {
    pub fn from_curve(curve: CurveConfig) -> anyhow::Result<Self> {
        curve.validate()?;
        let treasury = curve.treasury_address()?;
        Ok(Self { curve, treasury })
    }
}

/// Writes one settlement commits.
#[derive(Debug, Clone, PartialEq)]
pub struct TradePlan {
    pub direction: Direction,
    /// Lamports paid (buy) or received net of fee (sell)
    pub quote_amount: Lamports,
    pub asset_amount: AssetUnits,
    pub fee_total: Lamports,
    pub reserves: Reserves,
    pub lifecycle: Lifecycle,
    pub graduated_now: bool,
    pub price: Decimal,
    pub price_impact: Decimal,
    pub fill: Fill,
    pub fees: Vec<(FeeRole, Address, Lamports)>,
}

impl TradePlan {
    /// Materialise the rows once the store has assigned a trade id.
    pub fn into_settled(
        self,
        trade_id: i64,
        request: &TradeRequest,
        quote_usd_rate: Option<Decimal>,
    ) -> SettledTrade {
        let asset = request.asset.to_string();
        let fees = self
            .fees
            .iter()
            .map(|(role, recipient, amount)| FeeDistribution {
                trade_id,
                asset: asset.clone(),
                role: *role,
                recipient: recipient.to_string(),
                amount: *amount,
            })
            .collect();
        SettledTrade {
            trade: Trade {
                trade_id,
                asset,
                trader: request.trader.to_string(),
                direction: self.direction,
                quote_amount: self.quote_amount,
                asset_amount: self.asset_amount,
                fee_total: self.fee_total,
                price: self.price,
                quote_usd_rate,
                external_ref: request.external_ref.clone(),
                executed_at: request.executed_at,
            },
            fees,
            reserves: self.reserves,
            lifecycle: self.lifecycle,
            graduated_now: self.graduated_now,
            fill: self.fill,
            price_impact: self.price_impact,
        }
    }
}

/// Validate a request before touching the store.
pub fn validate_request(request: &TradeRequest) -> Result<(), MarketError> {
    if request.amount == 0 {
        return Err(MarketError::InvalidInput(
            "amount must be greater than zero".to_string(),
        ));
    }
    if request.external_ref.trim().is_empty() {
        return Err(MarketError::InvalidInput(
            "external settlement reference is required".to_string(),
        ));
    }
    if request.referrer == Some(request.trader) {
        return Err(MarketError::InvalidInput(
            "trader cannot refer themselves".to_string(),
        ));
    }
    Ok(())
}

/// Price `request` against `market` and produce the writes to commit.
///
/// Checks, in order: lifecycle, curve math, liquidity, slippage. Duplicate
/// references are the store's concern and are checked before this runs.
pub fn plan_trade(
    market: &Market,
    request: &TradeRequest,
    ctx: &SettlementContext,
) -> Result<TradePlan, MarketError> {
    if !market.lifecycle.accepts_curve_trades() {
        return Err(MarketError::AlreadyGraduated {
            asset: market.asset,
            lifecycle: market.lifecycle,
        });
    }

    let before = market.reserves;
    let (direction, quote_amount, asset_amount, fee_total, reserves, price_impact, fill, output) =
        match request.direction {
            Direction::Buy => {
                let q = quote_buy(request.amount, &before, ctx.curve.fee_rate)?;
                if q.asset_out > before.real_asset {
                    return Err(MarketError::InsufficientLiquidity {
                        requested: q.asset_out,
                        available: before.real_asset,
                    });
                }
                let reserves = Reserves {
                    virtual_quote: q.new_virtual_quote,
                    virtual_asset: q.new_virtual_asset,
                    real_quote: before.real_quote + q.quote_after_fee,
                    real_asset: before.real_asset - q.asset_out,
                };
                (
                    Direction::Buy,
                    q.quote_in,
                    q.asset_out,
                    q.fee,
                    reserves,
                    q.price_impact,
                    Fill::Full,
                    q.asset_out,
                )
            }
            Direction::Sell => {
                let circulating = market.circulating_supply();
                if request.amount > circulating {
                    return Err(MarketError::InvalidInput(format!(
                        "cannot sell {} units; only {} circulate",
                        request.amount, circulating
                    )));
                }
                let q = quote_sell(request.amount, &before, ctx.curve.fee_rate)?;
                if q.asset_in == 0 || q.quote_out == 0 {
                    return Err(MarketError::InsufficientLiquidity {
                        requested: request.amount,
                        available: 0,
                    });
                }
                if let Fill::Partial { requested, filled } = q.fill {
                    if !request.allow_partial_fill {
                        return Err(MarketError::InsufficientLiquidity {
                            requested,
                            available: filled,
                        });
                    }
                }
                let reserves = Reserves {
                    virtual_quote: q.new_virtual_quote,
                    virtual_asset: q.new_virtual_asset,
                    real_quote: before.real_quote - q.quote_out_gross,
                    real_asset: before.real_asset + q.asset_in,
                };
                (
                    Direction::Sell,
                    q.quote_out,
                    q.asset_in,
                    q.fee,
                    reserves,
                    q.price_impact,
                    q.fill,
                    q.quote_out,
                )
            }
        };

    if let Some(minimum) = request.min_output {
        if output < minimum {
            return Err(MarketError::SlippageExceeded {
                minimum,
                actual: output,
            });
        }
    }

    let graduated_now = reserves.real_quote >= ctx.curve.graduation_threshold;
    let lifecycle = if graduated_now {
        Lifecycle::Graduated
    } else {
        Lifecycle::Active
    };

    let fees = ctx
        .curve
        .fee_split
        .split(fee_total, request.referrer.is_some())
        .into_iter()
        .filter_map(|(role, amount)| {
            let recipient = match role {
                FeeRole::Protocol => ctx.treasury,
                FeeRole::Creator => market.creator,
                FeeRole::Referrer => request.referrer?,
            };
            Some((role, recipient, amount))
        })
        .collect();

    Ok(TradePlan {
        direction,
        quote_amount,
        asset_amount,
        fee_total,
        price: reserves.spot_price(),
        reserves,
        lifecycle,
        graduated_now,
        price_impact,
        fill,
        fees,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewMarket;

    const ONE_SOL: u64 = 1_000_000_000;

    fn addr(b: u8) -> Address {
        Address::new_from_array([b; 32])
    }

    fn ctx() -> SettlementContext {
        SettlementContext::from_curve(CurveConfig::default()).unwrap()
    }

    fn market() -> Market {
        Market::launch(&NewMarket::new(addr(1), addr(2)), &CurveConfig::default())
    }

    fn buy(amount: u64) -> TradeRequest {
        TradeRequest::new(addr(1), Direction::Buy, amount, addr(3), "sig-buy")
    }

    fn sell(amount: u64) -> TradeRequest {
        TradeRequest::new(addr(1), Direction::Sell, amount, addr(3), "sig-sell")
    }

    #[test]
    fn test_buy_moves_reserves() {
        let m = market();
        let plan = plan_trade(&m, &buy(ONE_SOL), &ctx()).unwrap();
        assert_eq!(plan.fee_total, 10_000_000);
        assert_eq!(plan.asset_amount, 34_277_831_558_567);
        assert_eq!(plan.reserves.real_quote, 990_000_000);
        assert_eq!(plan.reserves.real_asset, m.reserves.real_asset - 34_277_831_558_567);
        assert_eq!(plan.lifecycle, Lifecycle::Active);
        assert!(!plan.graduated_now);
        assert!(plan.price > m.spot_price());
    }

    #[test]
    fn test_fees_without_referrer_go_to_protocol_and_creator() {
        let plan = plan_trade(&market(), &buy(ONE_SOL), &ctx()).unwrap();
        let total: u64 = plan.fees.iter().map(|(_, _, a)| a).sum();
        assert_eq!(total, plan.fee_total);
        assert!(plan.fees.iter().all(|(role, _, _)| *role != FeeRole::Referrer));
        let creator = plan.fees.iter().find(|(r, _, _)| *r == FeeRole::Creator).unwrap();
        assert_eq!(creator.1, addr(2));
    }

    #[test]
    fn test_fees_with_referrer() {
        let request = buy(ONE_SOL).with_referrer(addr(9));
        let plan = plan_trade(&market(), &request, &ctx()).unwrap();
        let referrer = plan.fees.iter().find(|(r, _, _)| *r == FeeRole::Referrer).unwrap();
        assert_eq!(referrer.1, addr(9));
        assert_eq!(referrer.2, 2_000_000);
        let total: u64 = plan.fees.iter().map(|(_, _, a)| a).sum();
        assert_eq!(total, plan.fee_total);
    }

    #[test]
    fn test_graduated_market_rejects() {
        let mut m = market();
        m.lifecycle = Lifecycle::Graduated;
        let err = plan_trade(&m, &buy(ONE_SOL), &ctx()).unwrap_err();
        assert_eq!(err.code(), "ALREADY_GRADUATED");
    }

    #[test]
    fn test_crossing_threshold_graduates() {
        let mut m = market();
        m.reserves.real_quote = 84_500_000_000;
        // 0.81 SOL in, 0.8019 after fee
        let plan = plan_trade(&m, &buy(810_000_000), &ctx()).unwrap();
        assert!(plan.reserves.real_quote >= 85_000_000_000);
        assert!(plan.graduated_now);
        assert_eq!(plan.lifecycle, Lifecycle::Graduated);
    }

    #[test]
    fn test_buy_beyond_real_asset_rejected() {
        let mut m = market();
        m.reserves.real_asset = 1_000;
        let err = plan_trade(&m, &buy(ONE_SOL), &ctx()).unwrap_err();
        assert!(matches!(err, MarketError::InsufficientLiquidity { available: 1_000, .. }));
    }

    #[test]
    fn test_oversized_sell_rejected_without_tolerance() {
        let mut m = market();
        m.reserves.real_quote = ONE_SOL;
        m.reserves.real_asset -= 100_000_000_000_000;
        let err = plan_trade(&m, &sell(100_000_000_000_000), &ctx()).unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_LIQUIDITY");
    }

    #[test]
    fn test_oversized_sell_capped_with_tolerance() {
        let mut m = market();
        m.reserves.real_quote = ONE_SOL;
        m.reserves.real_asset -= 100_000_000_000_000;
        let request = sell(100_000_000_000_000).allowing_partial_fill();
        let plan = plan_trade(&m, &request, &ctx()).unwrap();
        assert!(plan.fill.is_partial());
        assert_eq!(plan.reserves.real_quote, 0);
        assert_eq!(plan.quote_amount + plan.fee_total, ONE_SOL);
        assert!(plan.asset_amount < 100_000_000_000_000);
    }

    #[test]
    fn test_partial_sell_against_empty_quote_reserve_rejected() {
        let m = market();
        assert_eq!(m.reserves.real_quote, 0);
        let request = sell(1_000_000).allowing_partial_fill();
        let err = plan_trade(&m, &request, &ctx()).unwrap_err();
        assert!(matches!(
            err,
            MarketError::InsufficientLiquidity {
                requested: 1_000_000,
                available: 0
            }
        ));
    }

    #[test]
    fn test_sell_more_than_circulating_rejected() {
        let err = plan_trade(&market(), &sell(300_000_000_000_000), &ctx()).unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[test]
    fn test_slippage_guard() {
        let request = buy(ONE_SOL).with_min_output(40_000_000_000_000);
        let err = plan_trade(&market(), &request, &ctx()).unwrap_err();
        assert!(matches!(
            err,
            MarketError::SlippageExceeded {
                minimum: 40_000_000_000_000,
                actual: 34_277_831_558_567
            }
        ));
    }

    #[test]
    fn test_validate_request() {
        assert!(validate_request(&buy(0)).is_err());
        assert!(validate_request(&TradeRequest::new(addr(1), Direction::Buy, 1, addr(3), " ")).is_err());
        assert!(validate_request(&buy(1).with_referrer(addr(3))).is_err());
        assert!(validate_request(&buy(1)).is_ok());
    }
}
