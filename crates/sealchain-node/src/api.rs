use crate::tally::{tally, TallyKind};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sealchain_core::{CancelToken, Chain, ChainError};
use sealchain_storage::{
    hydrate, init_chain, sled_store::SledStore, update_chain, Integrity, SnapshotStore,
    StoreError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SledStore>,
    pub difficulty: u32,
    pub mine_timeout: Duration,
    pub integrity: Integrity,
}

/// Metadata kept next to an entity's chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub quantity: Option<u64>,
    pub kind: TallyKind,
    pub candidates: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct NewEntity {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub quantity: Option<u64>,
    pub kind: TallyKind,
    #[serde(default)]
    pub candidates: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SignRequest {
    pub transaction: Value,
    /// Opaque tag stored on the mined block, e.g. a signature hash.
    pub data: String,
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Created {
    pub status: &'static str,
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct ChainView {
    pub length: usize,
    pub chain: Value,
}

#[derive(Debug, Serialize)]
pub struct Signed {
    pub status: &'static str,
    pub block_index: u64,
}

#[derive(Debug, Serialize)]
pub struct VerifyReport {
    pub valid: bool,
    pub length: usize,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TallyReport {
    pub status: &'static str,
    pub results: BTreeMap<String, u64>,
}

/// An HTTP status plus a message rendered as `{"error": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(id: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("entity {id} not found"),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let status = match err.downcast_ref::<ChainError>() {
            Some(ChainError::EmptyPool) => StatusCode::CONFLICT,
            Some(ChainError::LinkageMismatch { .. }) => StatusCode::CONFLICT,
            Some(ChainError::Cancelled { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            Some(_) => StatusCode::INTERNAL_SERVER_ERROR,
            None if err.downcast_ref::<StoreError>().is_some() => StatusCode::CONFLICT,
            None => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("request failed: {err:#}");
        }
        Self {
            status,
            message: format!("{err:#}"),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<ChainError> for ApiError {
    fn from(err: ChainError) -> Self {
        anyhow::Error::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn load_entity(state: &AppState, id: &str) -> Result<Entity, ApiError> {
    state
        .store
        .get_metadata::<Entity>(id)?
        .ok_or_else(|| ApiError::not_found(id))
}

fn load_chain(state: &AppState, id: &str) -> Result<Chain<Value>, ApiError> {
    hydrate(&*state.store, id, state.integrity)?.ok_or_else(|| ApiError::not_found(id))
}

pub async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

pub async fn create_entity(
    State(state): State<AppState>,
    payload: Result<Json<NewEntity>, JsonRejection>,
) -> ApiResult<Created> {
    let Json(req) = payload?;
    if req.title.trim().is_empty() {
        return Err(ApiError::bad_request("title must not be empty"));
    }
    let id = state.store.next_entity_id()?;
    let entity = Entity {
        id: id.clone(),
        title: req.title,
        description: req.description,
        start: req.start,
        end: req.end,
        quantity: req.quantity,
        kind: req.kind,
        candidates: req.candidates,
    };
    state.store.put_metadata(&id, &entity)?;
    init_chain::<Value, _>(&*state.store, &id)?;
    info!(%id, title = %entity.title, "entity created");
    Ok(Json(Created {
        status: "successfully added",
        id,
    }))
}

pub async fn list_entities(State(state): State<AppState>) -> ApiResult<Vec<String>> {
    Ok(Json(state.store.entity_ids()?))
}

pub async fn get_entity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Entity> {
    Ok(Json(load_entity(&state, &id)?))
}

pub async fn get_chain(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ChainView> {
    let chain = load_chain(&state, &id)?;
    Ok(Json(ChainView {
        length: chain.len(),
        chain: chain.export_json()?,
    }))
}

/// Adds the transaction and mines it into a new block, off the async
/// runtime and bounded by the configured timeout.
pub async fn sign(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<SignRequest>, JsonRejection>,
) -> ApiResult<Signed> {
    let Json(req) = payload?;
    let store = Arc::clone(&state.store);
    let (difficulty, integrity) = (state.difficulty, state.integrity);
    let cancel = CancelToken::with_timeout(state.mine_timeout);
    let entity = id.clone();

    let mined = tokio::task::spawn_blocking(move || {
        update_chain(&*store, &entity, integrity, |chain: &mut Chain<Value>| {
            chain.add_new_transaction(req.transaction.clone());
            chain.mine_parallel(req.data.clone(), difficulty, &cancel)
        })
    })
    .await
    .map_err(anyhow::Error::from)??;

    let block_index = mined.ok_or_else(|| ApiError::not_found(&id))?;
    info!(%id, block_index, "transaction mined");
    Ok(Json(Signed {
        status: "successful",
        block_index,
    }))
}

pub async fn verify(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<VerifyReport> {
    let chain: Chain<Value> =
        hydrate(&*state.store, &id, Integrity::Trusted)?.ok_or_else(|| ApiError::not_found(&id))?;
    let error = chain.verify(state.difficulty).err().map(|e| e.to_string());
    Ok(Json(VerifyReport {
        valid: error.is_none(),
        length: chain.len(),
        error,
    }))
}

pub async fn get_tally(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<TallyReport> {
    let entity = load_entity(&state, &id)?;
    let chain = load_chain(&state, &id)?;
    Ok(Json(TallyReport {
        status: "successful",
        results: tally(entity.kind, &entity.candidates, chain.blocks()),
    }))
}

pub async fn purge_entity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if !state.store.remove_snapshot(&id)? {
        return Err(ApiError::not_found(&id));
    }
    info!(%id, "entity purged");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sealchain_core::constants::DEFAULT_DIFFICULTY;

    fn state() -> AppState {
        AppState {
            store: Arc::new(SledStore::temporary().unwrap()),
            difficulty: DEFAULT_DIFFICULTY,
            mine_timeout: Duration::from_secs(30),
            integrity: Integrity::Trusted,
        }
    }

    async fn create(state: &AppState, kind: TallyKind) -> String {
        let req = NewEntity {
            title: "Board".to_string(),
            description: String::new(),
            start: None,
            end: None,
            quantity: None,
            kind,
            candidates: vec!["ann".to_string(), "bo".to_string(), "cy".to_string()],
        };
        create_entity(State(state.clone()), Ok(Json(req))).await.unwrap().0.id
    }

    async fn sign_ballot(state: &AppState, id: &str, ballot: Value) -> Result<u64, ApiError> {
        let req = SignRequest {
            transaction: ballot,
            data: "sighash".to_string(),
        };
        sign(State(state.clone()), Path(id.to_string()), Ok(Json(req)))
            .await
            .map(|json| json.0.block_index)
    }

    #[tokio::test]
    async fn create_then_read_chain() {
        let state = state();
        let id = create(&state, TallyKind::Single).await;

        let view = get_chain(State(state.clone()), Path(id.clone())).await.unwrap().0;
        assert_eq!(view.length, 1);
        assert_eq!(view.chain[0]["previous_hash"], "0");

        let entity = get_entity(State(state.clone()), Path(id.clone())).await.unwrap().0;
        assert_eq!(entity.id, id);
        let ids = list_entities(State(state)).await.unwrap().0;
        assert_eq!(ids, vec![id]);
    }

    #[tokio::test]
    async fn sign_mines_and_tally_counts() {
        let state = state();
        let id = create(&state, TallyKind::Ranked).await;

        assert_eq!(sign_ballot(&state, &id, json!(["ann", "bo", "cy"])).await.unwrap(), 1);
        assert_eq!(sign_ballot(&state, &id, json!("[bo, ann, cy]")).await.unwrap(), 2);

        let view = get_chain(State(state.clone()), Path(id.clone())).await.unwrap().0;
        assert_eq!(view.length, 3);
        assert!(view.chain[2]["hash"].as_str().unwrap().starts_with("00"));
        assert_eq!(view.chain[2]["data"], "sighash");

        let report = verify(State(state.clone()), Path(id.clone())).await.unwrap().0;
        assert!(report.valid);

        let tally = get_tally(State(state), Path(id)).await.unwrap().0;
        assert_eq!(tally.results["ann"], 5);
        assert_eq!(tally.results["bo"], 5);
        assert_eq!(tally.results["cy"], 2);
    }

    #[tokio::test]
    async fn unknown_entity_is_not_found() {
        let state = state();
        let err = sign_ballot(&state, "404", json!(["ann"])).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        let err = get_chain(State(state.clone()), Path("404".to_string())).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        let err = purge_entity(State(state), Path("404".to_string())).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn mining_timeout_is_unavailable() {
        let mut state = state();
        state.difficulty = 64;
        state.mine_timeout = Duration::ZERO;
        let id = create(&state, TallyKind::Single).await;

        let err = sign_ballot(&state, &id, json!(["ann"])).await.unwrap_err();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        let view = get_chain(State(state), Path(id)).await.unwrap().0;
        assert_eq!(view.length, 1);
    }

    #[tokio::test]
    async fn empty_title_is_rejected() {
        let state = state();
        let req = NewEntity {
            title: "  ".to_string(),
            description: String::new(),
            start: None,
            end: None,
            quantity: None,
            kind: TallyKind::Multi,
            candidates: Vec::new(),
        };
        let err = create_entity(State(state), Ok(Json(req))).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn contended_store_maps_to_conflict() {
        let err = ApiError::from(anyhow::Error::from(StoreError::Contended {
            entity: "7".to_string(),
            attempts: sealchain_storage::MAX_CAS_RETRIES,
        }));
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert!(err.message.contains("entity 7"), "{}", err.message);
    }
}
