//! The counter app served by the `trellis-hub` binary.

use crate::app::App;
use crate::events::{HandlerError, RegistryError};
use serde_json::Value;
use std::sync::Arc;
use trellis_core::cell::{CellError, CellStore, Scope};
use trellis_core::tree::Node;

pub fn counter_app(store: Arc<CellStore>) -> Result<App, CounterAppError> {
    let counter = store.declare_synced("counter", 0i64, Scope::Session)?;
    let clicks = store.declare(Some("clicks"), 0u64, Scope::Global)?;

    let (render_counter, render_clicks) = (counter.clone(), clicks.clone());
    let (inc_counter, inc_clicks) = (counter.clone(), clicks.clone());
    let (dec_counter, add_counter) = (counter.clone(), counter.clone());

    let app = App::builder(store, move |ctx| {
        let count = ctx.get(&render_counter)?;
        let total = ctx.get(&render_clicks)?;
        Ok(Node::new("div").children(vec![
            Node::text(count.to_string()).with_key("count"),
            Node::new("button")
                .with_key("inc")
                .prop("label", "+")
                .prop("on_click", "increment"),
            Node::new("button")
                .with_key("dec")
                .prop("label", "-")
                .prop("on_click", "decrement"),
            Node::text(format!("total clicks: {total}")).with_key("total"),
        ]))
    })
    .event_fn("increment", move |ctx, _| {
        ctx.update(&inc_counter, |n| n + 1)?;
        ctx.store().update(&inc_clicks, None, |n| n + 1)?;
        Ok(Value::from(ctx.get(&inc_counter)?))
    })
    .event_fn("decrement", move |ctx, _| {
        ctx.update(&dec_counter, |n| n - 1)?;
        Ok(Value::from(ctx.get(&dec_counter)?))
    })
    .event_fn("add", move |ctx, data| {
        let amount = amount(&data)?;
        ctx.update(&add_counter, |n| n + amount)?;
        Ok(Value::from(ctx.get(&add_counter)?))
    })
    .event_fn("reset", move |ctx, _| {
        ctx.set(&counter, 0)?;
        Ok(Value::from(0))
    })
    .build()?;
    Ok(app)
}

/// Accepts numbers from WebSocket payloads and strings from query params.
fn amount(data: &Value) -> Result<i64, HandlerError> {
    let raw = data
        .get("amount")
        .ok_or_else(|| HandlerError::InvalidData("missing amount".to_string()))?;
    raw.as_i64()
        .or_else(|| raw.as_str().and_then(|s| s.trim().parse().ok()))
        .ok_or_else(|| HandlerError::InvalidData(format!("amount is not an integer: {raw}")))
}

#[derive(Debug, thiserror::Error)]
pub enum CounterAppError {
    #[error(transparent)]
    Cell(#[from] CellError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
