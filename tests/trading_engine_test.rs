//! Integration tests for the trading engine
//! Listing, buying, selling, dilution and rollback against the in-memory store

use exchange_core::auth::{permissions, AuthContext};
use exchange_core::engine::models::{NewStock, Side, Stock};
use exchange_core::engine::pricing::{MAX_PRICE, MAX_SHARES};
use exchange_core::engine::{EngineSettings, TradeError, TradingEngine};
use exchange_core::events::{EventReceiver, MarketEvent};
use exchange_core::store::{MarketSnapshot, MemoryStore};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use uuid::Uuid;

fn trader(name: &str) -> AuthContext {
    AuthContext::new(Uuid::new_v4(), name, &[permissions::TRADES_EXECUTE])
}

fn admin() -> AuthContext {
    AuthContext::new(Uuid::new_v4(), "admin", &[permissions::ADMIN_FULL])
}

fn market(starting_balance: Decimal) -> (Arc<MemoryStore>, TradingEngine, EventReceiver) {
    let store = Arc::new(MemoryStore::new());
    let (engine, rx) = TradingEngine::new(
        store.clone(),
        MarketSnapshot::default(),
        EngineSettings { starting_balance },
    );
    (store, engine, rx)
}

async fn list(engine: &TradingEngine, total_shares: u64, price: Decimal) -> Stock {
    engine
        .create_stock(
            &admin(),
            NewStock {
                name: "Aria".to_string(),
                total_shares,
                initial_price: price,
            },
        )
        .await
        .unwrap()
}

fn drain(rx: &mut EventReceiver) -> Vec<MarketEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn held_plus_float(engine: &TradingEngine, stock_id: Uuid) -> u64 {
    let state = engine.snapshot().await;
    let held: u64 = state
        .positions
        .values()
        .filter(|p| p.stock_id == stock_id)
        .map(|p| p.shares)
        .sum();
    held + state.stocks[&stock_id].available_shares
}

#[cfg(test)]
mod trading_engine_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_stock_lists_full_float() {
        let (store, engine, _rx) = market(dec!(10000));
        let stock = list(&engine, 1000, dec!(10)).await;

        assert_eq!(stock.available_shares, 1000);
        assert_eq!(stock.current_price, dec!(10));
        assert_eq!(engine.price_history(stock.id).await.len(), 1);
        assert_eq!(store.snapshot().await.stocks.len(), 1);
    }

    #[tokio::test]
    async fn test_create_stock_validation() {
        let (_store, engine, _rx) = market(dec!(10000));
        let bad_price = engine
            .create_stock(
                &admin(),
                NewStock {
                    name: "Zero".to_string(),
                    total_shares: 100,
                    initial_price: dec!(0.001),
                },
            )
            .await;
        assert!(matches!(bad_price, Err(TradeError::InvalidPrice(_))));

        let denied = engine
            .create_stock(
                &trader("bob"),
                NewStock {
                    name: "Nope".to_string(),
                    total_shares: 100,
                    initial_price: dec!(1),
                },
            )
            .await;
        assert!(matches!(denied, Err(TradeError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_buy_moves_price_and_debits_cash() {
        let (_store, engine, _rx) = market(dec!(200));
        let stock = list(&engine, 1000, dec!(10)).await;
        let alice = trader("alice");
        engine.open_account(&alice).await.unwrap();

        let tx = engine.buy_stock(&alice, stock.id, 10).await.unwrap();

        assert_eq!(tx.side, Side::Buy);
        assert_eq!(tx.price_per_share, dec!(10));
        assert_eq!(tx.total_amount, dec!(100));

        let stock = engine.stock(stock.id).await.unwrap();
        assert_eq!(stock.available_shares, 990);
        assert_eq!(stock.current_price, dec!(10.25));

        let account = engine.account(alice.account_id).await.unwrap();
        assert_eq!(account.balance, dec!(100));

        let position = engine.position(alice.account_id, stock.id).await.unwrap();
        assert_eq!(position.shares, 10);
        assert_eq!(position.avg_buy_price, dec!(10));
        assert_eq!(engine.price_history(stock.id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_buy_rejections_leave_state_untouched() {
        let (_store, engine, _rx) = market(dec!(50));
        let stock = list(&engine, 100, dec!(10)).await;
        let alice = trader("alice");
        engine.open_account(&alice).await.unwrap();
        let before = engine.snapshot().await;

        assert!(matches!(
            engine.buy_stock(&alice, stock.id, 10).await,
            Err(TradeError::InsufficientFunds { .. })
        ));
        assert!(matches!(
            engine.buy_stock(&alice, stock.id, 0).await,
            Err(TradeError::InvalidQuantity)
        ));
        assert!(matches!(
            engine.buy_stock(&alice, stock.id, 101).await,
            Err(TradeError::InsufficientLiquidity { available: 100, requested: 101 })
        ));
        assert!(matches!(
            engine.buy_stock(&alice, Uuid::new_v4(), 1).await,
            Err(TradeError::StockNotFound(_))
        ));
        assert!(matches!(
            engine.buy_stock(&trader("ghost"), stock.id, 1).await,
            Err(TradeError::AccountNotFound(_))
        ));

        assert_eq!(engine.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_exhausted_float_solicits_holders() {
        let (_store, engine, mut rx) = market(dec!(10000));
        let stock = list(&engine, 10, dec!(10)).await;
        let holder = trader("holder");
        let buyer = trader("buyer");
        engine.open_account(&holder).await.unwrap();
        engine.open_account(&buyer).await.unwrap();
        engine.buy_stock(&holder, stock.id, 10).await.unwrap();
        drain(&mut rx);

        let result = engine.buy_stock(&buyer, stock.id, 2).await;
        assert!(matches!(
            result,
            Err(TradeError::InsufficientLiquidity { available: 0, requested: 2 })
        ));

        let events = drain(&mut rx);
        let request = events.iter().find_map(|e| match e {
            MarketEvent::LiquidityRequested {
                holders,
                requester,
                shares,
                offered_price,
                ..
            } => Some((holders.clone(), *requester, *shares, *offered_price)),
            _ => None,
        });
        let (holders, requester, shares, offered_price) = request.expect("liquidity request");
        assert_eq!(holders, vec![holder.account_id]);
        assert_eq!(requester, buyer.account_id);
        assert_eq!(shares, 2);

        let price = engine.stock(stock.id).await.unwrap().current_price;
        assert!(offered_price >= price * dec!(1.05) - dec!(0.01));
        assert!(offered_price <= price * dec!(1.15) + dec!(0.01));
    }

    #[tokio::test]
    async fn test_sell_credits_cash_and_keeps_cost_basis() {
        let (_store, engine, _rx) = market(dec!(10000));
        let stock = list(&engine, 1000, dec!(10)).await;
        let alice = trader("alice");
        engine.open_account(&alice).await.unwrap();

        engine.buy_stock(&alice, stock.id, 100).await.unwrap();
        assert_eq!(engine.stock(stock.id).await.unwrap().current_price, dec!(10.50));

        let tx = engine.sell_stock(&alice, stock.id, 50).await.unwrap();
        assert_eq!(tx.side, Side::Sell);
        assert_eq!(tx.price_per_share, dec!(10.50));
        assert_eq!(tx.total_amount, dec!(525));

        let stock_after = engine.stock(stock.id).await.unwrap();
        assert_eq!(stock_after.current_price, dec!(10.24));
        assert_eq!(stock_after.available_shares, 950);

        let position = engine.position(alice.account_id, stock.id).await.unwrap();
        assert_eq!(position.shares, 50);
        assert_eq!(position.avg_buy_price, dec!(10));
        assert_eq!(
            engine.account(alice.account_id).await.unwrap().balance,
            dec!(9525)
        );
    }

    #[tokio::test]
    async fn test_selling_everything_removes_position() {
        let (store, engine, _rx) = market(dec!(10000));
        let stock = list(&engine, 1000, dec!(10)).await;
        let alice = trader("alice");
        engine.open_account(&alice).await.unwrap();

        engine.buy_stock(&alice, stock.id, 20).await.unwrap();
        engine.sell_stock(&alice, stock.id, 20).await.unwrap();

        assert!(engine.position(alice.account_id, stock.id).await.is_none());
        assert!(store.snapshot().await.positions.is_empty());
        assert!(matches!(
            engine.sell_stock(&alice, stock.id, 1).await,
            Err(TradeError::PositionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sell_more_than_held_is_rejected() {
        let (_store, engine, _rx) = market(dec!(10000));
        let stock = list(&engine, 1000, dec!(10)).await;
        let alice = trader("alice");
        engine.open_account(&alice).await.unwrap();
        engine.buy_stock(&alice, stock.id, 5).await.unwrap();

        assert!(matches!(
            engine.sell_stock(&alice, stock.id, 6).await,
            Err(TradeError::InsufficientShares { held: 5, requested: 6 })
        ));
    }

    #[tokio::test]
    async fn test_price_never_drops_below_floor() {
        let (_store, engine, _rx) = market(dec!(10000));
        let stock = list(&engine, 10, dec!(0.01)).await;
        let alice = trader("alice");
        engine.open_account(&alice).await.unwrap();

        engine.buy_stock(&alice, stock.id, 10).await.unwrap();
        engine.sell_stock(&alice, stock.id, 10).await.unwrap();

        let price = engine.stock(stock.id).await.unwrap().current_price;
        assert!(price >= dec!(0.01));
        for point in engine.price_history(stock.id).await {
            assert!(point.price >= dec!(0.01));
        }
    }

    #[tokio::test]
    async fn test_single_trade_moves_price_at_most_a_quarter() {
        let (_store, engine, _rx) = market(dec!(100000));
        let stock = list(&engine, 100, dec!(20)).await;
        let whale = trader("whale");
        engine.open_account(&whale).await.unwrap();

        engine.buy_stock(&whale, stock.id, 100).await.unwrap();
        assert_eq!(engine.stock(stock.id).await.unwrap().current_price, dec!(25));

        engine.sell_stock(&whale, stock.id, 100).await.unwrap();
        assert_eq!(engine.stock(stock.id).await.unwrap().current_price, dec!(18.75));
    }

    #[tokio::test]
    async fn test_banned_user_cannot_trade() {
        let (_store, engine, _rx) = market(dec!(10000));
        let stock = list(&engine, 1000, dec!(10)).await;
        let alice = trader("alice");
        engine.open_account(&alice).await.unwrap();
        engine.buy_stock(&alice, stock.id, 5).await.unwrap();

        let until = chrono::Utc::now() + chrono::Duration::hours(1);
        engine
            .set_ban(&admin(), alice.account_id, Some(until))
            .await
            .unwrap();

        assert!(matches!(
            engine.buy_stock(&alice, stock.id, 1).await,
            Err(TradeError::UserBanned)
        ));
        assert!(matches!(
            engine.sell_stock(&alice, stock.id, 1).await,
            Err(TradeError::UserBanned)
        ));

        engine.set_ban(&admin(), alice.account_id, None).await.unwrap();
        assert!(engine.buy_stock(&alice, stock.id, 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_ban_requires_admin() {
        let (_store, engine, _rx) = market(dec!(10000));
        let alice = trader("alice");
        engine.open_account(&alice).await.unwrap();

        assert!(matches!(
            engine.set_ban(&trader("mallory"), alice.account_id, None).await,
            Err(TradeError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_commit_rolls_back_exactly() {
        let (store, engine, mut rx) = market(dec!(10000));
        let stock = list(&engine, 1000, dec!(10)).await;
        let alice = trader("alice");
        engine.open_account(&alice).await.unwrap();
        engine.buy_stock(&alice, stock.id, 30).await.unwrap();
        drain(&mut rx);

        let before = engine.snapshot().await;
        let commits = store.commit_count();
        store.fail_commits(true);

        assert!(matches!(
            engine.buy_stock(&alice, stock.id, 10).await,
            Err(TradeError::Persistence(_))
        ));
        assert_eq!(engine.snapshot().await, before);

        assert!(matches!(
            engine.sell_stock(&alice, stock.id, 30).await,
            Err(TradeError::Persistence(_))
        ));
        assert_eq!(engine.snapshot().await, before);
        assert_eq!(store.commit_count(), commits);

        let failures: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, MarketEvent::TradeFailed { .. }))
            .collect();
        assert_eq!(failures.len(), 2);

        store.fail_commits(false);
        assert!(engine.buy_stock(&alice, stock.id, 10).await.is_ok());
    }

    #[tokio::test]
    async fn test_shares_are_conserved_across_trades() {
        let (_store, engine, _rx) = market(dec!(100000));
        let stock = list(&engine, 500, dec!(4)).await;
        let traders: Vec<AuthContext> = (0..4).map(|i| trader(&format!("t{}", i))).collect();
        for t in &traders {
            engine.open_account(t).await.unwrap();
        }

        for (i, t) in traders.iter().enumerate() {
            engine.buy_stock(t, stock.id, 20 + i as u64 * 15).await.unwrap();
            assert_eq!(held_plus_float(&engine, stock.id).await, 500);
        }
        for t in &traders {
            engine.sell_stock(t, stock.id, 10).await.unwrap();
            assert_eq!(held_plus_float(&engine, stock.id).await, 500);
        }
    }

    #[tokio::test]
    async fn test_concurrent_buys_never_oversell() {
        let (_store, engine, _rx) = market(dec!(100000));
        let engine = Arc::new(engine);
        let stock_id = list(&engine, 50, dec!(1)).await.id;

        let mut handles = Vec::new();
        for i in 0..10 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                let t = trader(&format!("t{}", i));
                engine.open_account(&t).await.unwrap();
                engine.buy_stock(&t, stock_id, 7).await.is_ok()
            }));
        }

        let mut filled = 0;
        for handle in handles {
            if handle.await.unwrap() {
                filled += 1;
            }
        }

        assert_eq!(filled, 7);
        assert_eq!(engine.stock(stock_id).await.unwrap().available_shares, 1);
        assert_eq!(held_plus_float(&engine, stock_id).await, 50);
    }

    #[tokio::test]
    async fn test_dilution_halves_price_when_supply_doubles() {
        let (_store, engine, mut rx) = market(dec!(10000));
        let stock = list(&engine, 1000, dec!(10)).await;
        let alice = trader("alice");
        engine.open_account(&alice).await.unwrap();
        engine.buy_stock(&alice, stock.id, 40).await.unwrap();
        assert_eq!(engine.stock(stock.id).await.unwrap().current_price, dec!(10.25));
        drain(&mut rx);

        let diluted = engine.create_shares(&admin(), stock.id, 1000).await.unwrap();

        assert_eq!(diluted.total_shares, 2000);
        assert_eq!(diluted.available_shares, 1960);
        assert_eq!(diluted.current_price, dec!(5.13));

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            MarketEvent::SharesIssued { holders, new_shares: 1000, .. }
                if holders == &vec![alice.account_id]
        )));
    }

    #[tokio::test]
    async fn test_dilution_requires_admin() {
        let (_store, engine, _rx) = market(dec!(10000));
        let stock = list(&engine, 1000, dec!(10)).await;

        assert!(matches!(
            engine.create_shares(&trader("bob"), stock.id, 10).await,
            Err(TradeError::Unauthorized(_))
        ));
        assert!(matches!(
            engine.create_shares(&admin(), stock.id, 0).await,
            Err(TradeError::InvalidQuantity)
        ));
    }

    #[tokio::test]
    async fn test_inflate_market_scales_every_price() {
        let (_store, engine, _rx) = market(dec!(10000));
        let a = list(&engine, 100, dec!(10)).await;
        let b = list(&engine, 100, dec!(3.33)).await;

        let touched = engine.inflate_market(&admin(), dec!(10)).await.unwrap();
        assert_eq!(touched, 2);
        assert_eq!(engine.stock(a.id).await.unwrap().current_price, dec!(11));
        assert_eq!(engine.stock(b.id).await.unwrap().current_price, dec!(3.66));

        assert!(matches!(
            engine.inflate_market(&admin(), dec!(-100)).await,
            Err(TradeError::InvalidPrice(_))
        ));
    }

    #[tokio::test]
    async fn test_market_data_and_capitalization() {
        let (_store, engine, _rx) = market(dec!(10000));
        list(&engine, 100, dec!(10)).await;
        list(&engine, 50, dec!(20)).await;

        let points = engine.market_data().await;
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].total_market_cap, dec!(30));
        assert_eq!(points[0].average_price, dec!(15));

        assert_eq!(engine.market_capitalization().await, dec!(2000));
    }

    #[tokio::test]
    async fn test_portfolio_value_marks_to_market() {
        let (_store, engine, _rx) = market(dec!(10000));
        let stock = list(&engine, 1000, dec!(10)).await;
        let alice = trader("alice");
        engine.open_account(&alice).await.unwrap();
        engine.buy_stock(&alice, stock.id, 10).await.unwrap();

        assert_eq!(engine.portfolio_value(alice.account_id).await, dec!(102.50));
        assert_eq!(engine.transactions_for(alice.account_id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_open_account_is_idempotent() {
        let (_store, engine, _rx) = market(dec!(10000));
        let alice = trader("alice");

        let first = engine.open_account(&alice).await.unwrap();
        let second = engine.open_account(&alice).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.balance, dec!(10000));
    }

    #[tokio::test]
    async fn test_state_survives_reload() {
        let (store, engine, _rx) = market(dec!(10000));
        let stock = list(&engine, 1000, dec!(10)).await;
        let alice = trader("alice");
        engine.open_account(&alice).await.unwrap();
        engine.buy_stock(&alice, stock.id, 25).await.unwrap();
        engine.sell_stock(&alice, stock.id, 5).await.unwrap();

        let (reloaded, _rx2) = TradingEngine::load(store.clone(), EngineSettings::default())
            .await
            .unwrap();
        assert_eq!(reloaded.snapshot().await, engine.snapshot().await);
    }

    #[tokio::test]
    async fn test_dilution_keeps_local_state_when_commit_fails() {
        let (store, engine, _rx) = market(dec!(10000));
        let stock = list(&engine, 1000, dec!(10)).await;
        let commits = store.commit_count();
        store.fail_commits(true);

        let diluted = engine.create_shares(&admin(), stock.id, 1000).await.unwrap();
        assert_eq!(diluted.total_shares, 2000);
        assert_eq!(diluted.current_price, dec!(5));

        let local = engine.stock(stock.id).await.unwrap();
        assert_eq!(local.total_shares, 2000);
        assert_eq!(local.available_shares, 2000);
        assert_eq!(local.current_price, dec!(5));
        assert_eq!(engine.price_history(stock.id).await.len(), 2);

        assert_eq!(store.commit_count(), commits);
        assert_eq!(store.snapshot().await.stocks[0].total_shares, 1000);
    }

    #[tokio::test]
    async fn test_inflation_keeps_local_state_when_commit_fails() {
        let (store, engine, _rx) = market(dec!(10000));
        let stock = list(&engine, 100, dec!(10)).await;
        let commits = store.commit_count();
        store.fail_commits(true);

        assert_eq!(engine.inflate_market(&admin(), dec!(10)).await.unwrap(), 1);
        assert_eq!(engine.stock(stock.id).await.unwrap().current_price, dec!(11));
        assert_eq!(store.commit_count(), commits);
        assert_eq!(store.snapshot().await.stocks[0].current_price, dec!(10));
    }

    #[tokio::test]
    async fn test_listing_beyond_price_or_supply_limits_is_rejected() {
        let (store, engine, _rx) = market(dec!(10000));
        let huge_price = engine
            .create_stock(
                &admin(),
                NewStock {
                    name: "Vicious".to_string(),
                    total_shares: 1000000000000,
                    initial_price: dec!(100000000000000000000),
                },
            )
            .await;
        assert!(matches!(huge_price, Err(TradeError::InvalidPrice(_))));

        let huge_supply = engine
            .create_stock(
                &admin(),
                NewStock {
                    name: "Julia".to_string(),
                    total_shares: u64::MAX,
                    initial_price: dec!(1),
                },
            )
            .await;
        assert!(matches!(huge_supply, Err(TradeError::InvalidQuantity)));
        assert!(store.snapshot().await.stocks.is_empty());

        let stock = list(&engine, MAX_SHARES, dec!(1)).await;
        assert!(matches!(
            engine.create_shares(&admin(), stock.id, 1).await,
            Err(TradeError::InvalidQuantity)
        ));
        assert_eq!(engine.stock(stock.id).await.unwrap().total_shares, MAX_SHARES);
    }

    #[tokio::test]
    async fn test_compounded_inflation_saturates_at_price_ceiling() {
        let (_store, engine, _rx) = market(dec!(10000));
        let stock = list(&engine, MAX_SHARES, dec!(1)).await;

        for _ in 0..3 {
            engine
                .inflate_market(&admin(), dec!(1000000000000))
                .await
                .unwrap();
        }

        assert_eq!(engine.stock(stock.id).await.unwrap().current_price, MAX_PRICE);
        assert_eq!(
            engine.market_capitalization().await,
            MAX_PRICE * Decimal::from(MAX_SHARES)
        );
    }

    #[tokio::test]
    async fn test_sale_overflowing_balance_is_rejected() {
        let (_store, engine, _rx) = market(Decimal::MAX);
        let stock = list(&engine, 1000, dec!(10)).await;
        let alice = trader("alice");
        engine.open_account(&alice).await.unwrap();
        engine.buy_stock(&alice, stock.id, 10).await.unwrap();
        let before = engine.snapshot().await;

        assert!(matches!(
            engine.sell_stock(&alice, stock.id, 10).await,
            Err(TradeError::OutOfRange(_))
        ));
        assert_eq!(engine.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_unknown_stock_is_rejected_before_locking() {
        let (_store, engine, _rx) = market(dec!(10000));
        let alice = trader("alice");
        engine.open_account(&alice).await.unwrap();

        for _ in 0..10 {
            let missing = Uuid::new_v4();
            assert!(matches!(
                engine.buy_stock(&alice, missing, 1).await,
                Err(TradeError::StockNotFound(id)) if id == missing
            ));
            assert!(matches!(
                engine.sell_stock(&alice, missing, 1).await,
                Err(TradeError::StockNotFound(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_portfolio_holdings_report_unrealized_gain() {
        let (_store, engine, _rx) = market(dec!(10000));
        let stock = list(&engine, 1000, dec!(10)).await;
        let alice = trader("alice");
        engine.open_account(&alice).await.unwrap();
        engine.buy_stock(&alice, stock.id, 10).await.unwrap();

        let holdings = engine.holdings(alice.account_id).await;
        assert_eq!(holdings.len(), 1);
        assert_eq!(holdings[0].position.shares, 10);
        assert_eq!(holdings[0].current_price, dec!(10.25));
        assert_eq!(holdings[0].market_value, dec!(102.50));
        assert_eq!(holdings[0].unrealized_pnl, dec!(2.50));
    }
}
