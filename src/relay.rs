use crate::adaptor::{self, ApiType, RelayContext};
use crate::app::AppState;
use crate::dto::Usage;
use crate::error::RelayError;
use crate::frame::FrameWriter;
use crate::pricing::{PricingTable, Quote};
use crate::quota::{QuotaLedger, ReservationGuard, Settlement};
use crate::relay_info::RelayInfo;
use axum::http::StatusCode;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

/// Rewrites `info.upstream_model_name` through the channel's model mapping.
/// An empty mapping or `{}` leaves the name untouched.
pub fn resolve_model_mapping(info: &mut RelayInfo) -> Result<(), RelayError> {
    let raw = info.channel.model_mapping.trim();
    if raw.is_empty() || raw == "{}" {
        return Ok(());
    }
    let mapping: HashMap<String, String> =
        serde_json::from_str(raw).map_err(RelayError::InvalidMapping)?;
    if let Some(mapped) = mapping.get(&info.origin_model_name) {
        if !mapped.is_empty() {
            tracing::debug!(
                origin = %info.origin_model_name,
                upstream = %mapped,
                "model mapped"
            );
            info.upstream_model_name = mapped.clone();
        }
    }
    Ok(())
}

/// Applies the channel's status-code mapping to an upstream failure. Keys and
/// values are decimal status codes; a `200` key is never remapped.
pub fn reset_status_code(err: &mut RelayError, mapping: &str) {
    let raw = mapping.trim();
    if raw.is_empty() || raw == "{}" {
        return;
    }
    let RelayError::Upstream { status, .. } = err else {
        return;
    };
    let table: HashMap<String, String> = match serde_json::from_str(raw) {
        Ok(table) => table,
        Err(err) => {
            tracing::warn!(error = %err, "ignoring malformed status code mapping");
            return;
        }
    };
    let key = status.as_u16().to_string();
    if key == "200" {
        return;
    }
    let Some(target) = table.get(&key) else {
        return;
    };
    match target.parse::<u16>().ok().and_then(|code| StatusCode::from_u16(code).ok()) {
        Some(mapped) => *status = mapped,
        None => tracing::warn!(from = %key, to = %target, "invalid status code mapping target"),
    }
}

async fn rollback(guard: ReservationGuard, info: &RelayInfo) {
    if let Err(err) = guard.rollback().await {
        tracing::error!(
            request_id = %info.request_id,
            user_id = %info.user_id,
            error = %err,
            "quota rollback failed"
        );
    }
}

/// Runs one request through the adaptor for its channel, reserving quota
/// before the upstream call and settling on the usage the adaptor reports.
pub async fn relay(
    state: &AppState,
    info: &mut RelayInfo,
    downstream: FrameWriter,
    body: Option<Bytes>,
) -> Result<Usage, RelayError> {
    resolve_model_mapping(info)?;

    let settings = state
        .settings_store
        .get_all()
        .await
        .map_err(RelayError::Settings)?;
    let pricing = PricingTable::from_settings(&settings);
    let quote = Quote::for_model(&pricing, &info.upstream_model_name, &info.group);
    info.use_price = quote.use_price();

    let ledger: Arc<dyn QuotaLedger> = Arc::new(state.quota_store.clone());
    let guard = ReservationGuard::acquire(ledger, &info.user_id, quote.pre_consume).await?;

    let api_type = match ApiType::from_tag(&info.api_type) {
        Ok(api_type) => api_type,
        Err(err) => {
            rollback(guard, info).await;
            return Err(err);
        }
    };
    let adaptor = adaptor::adaptor_for(api_type);
    let ctx = RelayContext {
        http: state.http.clone(),
        settings: Arc::new(settings),
        estimator: state.estimator.clone(),
        downstream,
    };

    adaptor.init(info);
    let upstream = match adaptor.do_request(&ctx, info, body).await {
        Ok(upstream) => upstream,
        Err(err) => {
            tracing::warn!(
                request_id = %info.request_id,
                channel = %info.channel.id,
                error = %err,
                "upstream request failed"
            );
            metrics::counter!(
                "relay_requests_total",
                "api_type" => api_type.as_str(),
                "outcome" => "request_failed"
            )
            .increment(1);
            rollback(guard, info).await;
            return Err(err);
        }
    };

    let usage = match adaptor.do_response(&ctx, upstream, info).await {
        Ok(usage) => usage,
        Err(mut err) => {
            reset_status_code(&mut err, &info.channel.status_code_mapping);
            tracing::warn!(
                request_id = %info.request_id,
                channel = %info.channel.id,
                status = %err.status(),
                error = %err,
                "upstream response failed"
            );
            metrics::counter!(
                "relay_requests_total",
                "api_type" => api_type.as_str(),
                "outcome" => "response_failed"
            )
            .increment(1);
            rollback(guard, info).await;
            return Err(err);
        }
    };

    let true_cost = quote.settle_cost(&usage);
    let settlement = Settlement {
        request_id: info.request_id.clone(),
        channel_id: info.channel.id.clone(),
        model: info.upstream_model_name.clone(),
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        model_ratio: quote.model_ratio,
        group_ratio: quote.group_ratio,
        completion_ratio: quote.completion_ratio,
        model_price: quote.model_price,
        use_price: quote.use_price(),
    };
    // The response is already out; a failed settlement cannot be reported to
    // the client.
    if let Err(err) = guard.settle(true_cost, &settlement).await {
        tracing::error!(
            request_id = %info.request_id,
            user_id = %info.user_id,
            true_cost,
            error = %err,
            "quota settlement failed"
        );
        metrics::counter!("relay_settle_failures_total").increment(1);
    }
    metrics::counter!(
        "relay_requests_total",
        "api_type" => api_type.as_str(),
        "outcome" => "ok"
    )
    .increment(1);
    tracing::info!(
        request_id = %info.request_id,
        model = %info.origin_model_name,
        upstream_model = %info.upstream_model_name,
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        true_cost,
        "relay settled"
    );
    Ok(usage)
}
