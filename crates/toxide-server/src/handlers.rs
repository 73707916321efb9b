//! API route handlers.

use std::collections::BTreeMap;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use tracing::{debug, info};

use toxide_core::{Direction, Toxic, ToxicChain, ToxicDefinition, ToxicPatch};
use toxide_proxy::{ProxyConfig, ProxyUpdate};

use crate::error::{ApiError, Result};
use crate::models::{PopulateResponse, ProxiesQuery, ProxyResponse, ToxicAttributes};
use crate::state::AppState;

/// Unwraps a JSON body, turning extractor rejections into API errors.
fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

fn direction(raw: &str) -> Result<Direction> {
    Ok(raw.parse::<Direction>()?)
}

/// Resolves `name` and `direction` to a toxic chain, then runs `f` on it.
fn with_chain<T>(
    state: &AppState,
    name: &str,
    raw_direction: &str,
    f: impl FnOnce(&ToxicChain) -> Result<T>,
) -> Result<T> {
    let direction = direction(raw_direction)?;
    let proxy = state.registry.find(name)?;
    f(proxy.toxics().get(direction))
}

/// Finds the chain of proxy `name` that holds `toxic`, then runs `f` on it.
fn with_named_toxic<T>(
    state: &AppState,
    name: &str,
    toxic: &str,
    f: impl FnOnce(&ToxicChain) -> Result<T>,
) -> Result<T> {
    let proxy = state.registry.find(name)?;
    f(proxy.toxics().locate(toxic)?)
}

fn add_to_chain(proxy: &str, chain: &ToxicChain, definition: ToxicDefinition) -> Result<Toxic> {
    let toxic = chain.add(definition.resolve(chain.direction())?)?;
    info!(
        proxy = %proxy,
        toxic = %toxic.name,
        kind = toxic.type_name(),
        stream = %toxic.stream,
        toxicity = toxic.toxicity,
        "Toxic added"
    );
    Ok(toxic)
}

fn patch_in_chain(
    proxy: &str,
    chain: &ToxicChain,
    toxic: &str,
    patch: &ToxicPatch,
) -> Result<Toxic> {
    let updated = chain.update(toxic, patch)?;
    info!(proxy = %proxy, toxic = %updated.name, toxicity = updated.toxicity, "Toxic updated");
    Ok(updated)
}

fn remove_from_chain(proxy: &str, chain: &ToxicChain, toxic: &str) -> Result<StatusCode> {
    chain.remove(toxic)?;
    info!(proxy = %proxy, toxic = %toxic, "Toxic removed");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /version - Server version.
pub async fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// POST /reset - Enable every proxy and remove all toxics.
pub async fn reset(State(state): State<AppState>) -> StatusCode {
    state.registry.reset().await;
    StatusCode::NO_CONTENT
}

/// GET /proxies - All proxies keyed by name.
pub async fn list_proxies(
    State(state): State<AppState>,
    Query(query): Query<ProxiesQuery>,
) -> Result<Json<BTreeMap<String, ProxyResponse>>> {
    let proxies = match query.filter.as_deref() {
        Some(pattern) => state.registry.grep(pattern)?,
        None => state.registry.list(),
    };

    Ok(Json(
        proxies
            .iter()
            .map(|proxy| (proxy.name().to_string(), ProxyResponse::summary(proxy)))
            .collect(),
    ))
}

/// POST /proxies - Create a proxy.
pub async fn create_proxy(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ProxyConfig>, JsonRejection>,
) -> Result<(StatusCode, Json<ProxyResponse>)> {
    let config = body(payload)?;
    debug!(proxy = %config.name, listen = %config.listen, "Creating proxy");

    let proxy = state.registry.create(config).await?;
    Ok((StatusCode::CREATED, Json(ProxyResponse::detailed(&proxy))))
}

/// POST /populate - Create or replace a set of proxies.
pub async fn populate(
    State(state): State<AppState>,
    payload: std::result::Result<Json<Vec<ProxyConfig>>, JsonRejection>,
) -> Result<(StatusCode, Json<PopulateResponse>)> {
    let configs = body(payload)?;
    let proxies = state.registry.populate(configs).await?;

    info!(count = proxies.len(), "Populated proxies");
    Ok((
        StatusCode::CREATED,
        Json(PopulateResponse {
            proxies: proxies
                .iter()
                .map(|proxy| ProxyResponse::detailed(proxy))
                .collect(),
        }),
    ))
}

/// GET /proxies/{name} - One proxy with its toxics.
pub async fn get_proxy(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ProxyResponse>> {
    let proxy = state.registry.find(&name)?;
    Ok(Json(ProxyResponse::detailed(&proxy)))
}

/// POST /proxies/{name} - Change addresses or enable/disable.
pub async fn update_proxy(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: std::result::Result<Json<ProxyUpdate>, JsonRejection>,
) -> Result<Json<ProxyResponse>> {
    let update = body(payload)?;
    let proxy = state.registry.update(&name, update).await?;
    Ok(Json(ProxyResponse::detailed(&proxy)))
}

/// DELETE /proxies/{name} - Stop and remove a proxy.
pub async fn delete_proxy(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    state.registry.delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /proxies/{name}/toxics - Toxics of both directions.
pub async fn list_all_toxics(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<Toxic>>> {
    let proxy = state.registry.find(&name)?;
    Ok(Json(proxy.toxics().list()))
}

/// POST /proxies/{name}/toxics - Attach a toxic to the chain named by its `stream`.
pub async fn add_toxic(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: std::result::Result<Json<ToxicDefinition>, JsonRejection>,
) -> Result<Json<Toxic>> {
    let definition = body(payload)?;
    let stream = definition.stream()?;
    let proxy = state.registry.find(&name)?;
    add_to_chain(&name, proxy.toxics().get(stream), definition).map(Json)
}

/// GET /proxies/{name}/toxics/{toxic} - One toxic, looked up in both directions.
pub async fn get_named_toxic(
    State(state): State<AppState>,
    Path((name, toxic)): Path<(String, String)>,
) -> Result<Json<Toxic>> {
    with_named_toxic(&state, &name, &toxic, |chain| Ok(Json(chain.get(&toxic)?)))
}

/// POST /proxies/{name}/toxics/{toxic} - Change a toxic in whichever direction holds it.
pub async fn update_named_toxic(
    State(state): State<AppState>,
    Path((name, toxic)): Path<(String, String)>,
    payload: std::result::Result<Json<ToxicPatch>, JsonRejection>,
) -> Result<Json<Toxic>> {
    let patch = body(payload)?;
    with_named_toxic(&state, &name, &toxic, |chain| {
        patch_in_chain(&name, chain, &toxic, &patch).map(Json)
    })
}

/// DELETE /proxies/{name}/toxics/{toxic} - Detach a toxic from whichever direction holds it.
pub async fn delete_named_toxic(
    State(state): State<AppState>,
    Path((name, toxic)): Path<(String, String)>,
) -> Result<StatusCode> {
    with_named_toxic(&state, &name, &toxic, |chain| {
        remove_from_chain(&name, chain, &toxic)
    })
}

/// GET /proxies/{name}/{direction}/toxics - Attributes of one direction's toxics keyed by name.
pub async fn list_toxics(
    State(state): State<AppState>,
    Path((name, raw_direction)): Path<(String, String)>,
) -> Result<Json<BTreeMap<String, ToxicAttributes>>> {
    with_chain(&state, &name, &raw_direction, |chain| {
        Ok(Json(
            chain
                .snapshot()
                .iter()
                .map(|toxic| (toxic.name.clone(), ToxicAttributes::from(toxic)))
                .collect(),
        ))
    })
}

/// POST /proxies/{name}/{direction}/toxics - Attach a toxic.
pub async fn create_toxic(
    State(state): State<AppState>,
    Path((name, raw_direction)): Path<(String, String)>,
    payload: std::result::Result<Json<ToxicDefinition>, JsonRejection>,
) -> Result<Json<Toxic>> {
    let definition = body(payload)?;
    with_chain(&state, &name, &raw_direction, |chain| {
        add_to_chain(&name, chain, definition).map(Json)
    })
}

/// GET /proxies/{name}/{direction}/toxics/{toxic} - One toxic.
pub async fn get_toxic(
    State(state): State<AppState>,
    Path((name, raw_direction, toxic)): Path<(String, String, String)>,
) -> Result<Json<Toxic>> {
    with_chain(&state, &name, &raw_direction, |chain| {
        Ok(Json(chain.get(&toxic)?))
    })
}

/// POST /proxies/{name}/{direction}/toxics/{toxic} - Change toxicity or attributes.
pub async fn update_toxic(
    State(state): State<AppState>,
    Path((name, raw_direction, toxic)): Path<(String, String, String)>,
    payload: std::result::Result<Json<ToxicPatch>, JsonRejection>,
) -> Result<Json<Toxic>> {
    let patch = body(payload)?;
    with_chain(&state, &name, &raw_direction, |chain| {
        patch_in_chain(&name, chain, &toxic, &patch).map(Json)
    })
}

/// DELETE /proxies/{name}/{direction}/toxics/{toxic} - Detach a toxic.
pub async fn delete_toxic(
    State(state): State<AppState>,
    Path((name, raw_direction, toxic)): Path<(String, String, String)>,
) -> Result<StatusCode> {
    with_chain(&state, &name, &raw_direction, |chain| {
        remove_from_chain(&name, chain, &toxic)
    })
}
