//! Operations served by the standalone backend.

use std::time::Duration;

use conduit_core::{OperationContext, OperationError, OperationRegistry, OperationResult, RpcValue};
use serde_json::json;
use tracing::debug;

/// Longest sleep a caller may request.
const MAX_SLEEP: Duration = Duration::from_secs(600);

/// Progress interval for `Sleep`.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Build the operation table.
pub fn registry() -> conduit_core::Result<OperationRegistry> {
    let mut ops = OperationRegistry::new();
    ops.register("Add", "1.0", add)?;
    ops.register("Echo", "1.0", echo)?;
    ops.register("Sleep", "1.0", sleep)?;
    ops.register_in("math", "Divide", "1.1", divide)?;
    Ok(ops)
}

async fn add(params: RpcValue, _ctx: OperationContext) -> OperationResult {
    let (a, b): (f64, f64) = params.deserialize_into()?;
    let sum = a + b;
    if sum.fract() == 0.0 && sum.abs() < i64::MAX as f64 {
        Ok(RpcValue::from(sum as i64))
    } else {
        RpcValue::from_serialize(&sum).map_err(Into::into)
    }
}

async fn echo(params: RpcValue, ctx: OperationContext) -> OperationResult {
    debug!("Echoing request {}", ctx.request_id());
    Ok(params)
}

async fn divide(params: RpcValue, _ctx: OperationContext) -> OperationResult {
    let (a, b): (i64, i64) = params.deserialize_into()?;
    if b == 0 {
        return Err(OperationError::new("DivideByZero", "cannot divide by zero"));
    }
    let quotient = a
        .checked_div(b)
        .ok_or_else(|| OperationError::new("Overflow", "quotient does not fit in i64"))?;
    Ok(RpcValue::from(quotient))
}

/// Sleep for `ms` milliseconds, reporting progress, until done or cancelled.
async fn sleep(params: RpcValue, ctx: OperationContext) -> OperationResult {
    let ms = params
        .get("ms")
        .and_then(RpcValue::as_i64)
        .ok_or_else(|| OperationError::new("InvalidParams", "expected {\"ms\": <integer>}"))?;
    let total = Duration::from_millis(ms.max(0) as u64).min(MAX_SLEEP);

    let started = tokio::time::Instant::now();
    let mut ticks = tokio::time::interval(PROGRESS_INTERVAL);
    loop {
        let elapsed = started.elapsed();
        if elapsed >= total {
            break;
        }
        tokio::select! {
            _ = ticks.tick() => {
                let percent = elapsed.as_millis() * 100 / total.as_millis().max(1);
                ctx.report_progress(json!({ "percent": percent as u64 }));
            }
            _ = tokio::time::sleep(total - elapsed) => break,
            _ = ctx.cancellation().cancelled() => {
                return Err(OperationError::new("Cancelled", "sleep interrupted"));
            }
        }
    }
    Ok(RpcValue::object([("slept_ms", RpcValue::from(total.as_millis() as u64))]))
}
