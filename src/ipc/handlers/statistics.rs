use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::rollup::EntityDim;
use crate::round::{RoundService, StatsFilter};
use crate::store::SqliteStore;

fn handle_compute(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(round_id) = req.params.get("roundId").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing roundId", None);
    };

    let entity_dim = match req.params.get("entityDim").and_then(|v| v.as_str()) {
        None => None,
        Some(s) => match EntityDim::from_str(s) {
            Some(d) => Some(d),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("entityDim must be faculty, major or teacher, got {:?}", s),
                    None,
                )
            }
        },
    };
    let entity_id = req
        .params
        .get("entityId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    if entity_id.is_some() && entity_dim.is_none() {
        return err(
            &req.id,
            "bad_params",
            "entityId requires entityDim",
            None,
        );
    }

    let store = SqliteStore::new(conn);
    let svc = RoundService::new(&store);
    let filter = StatsFilter {
        entity_dim,
        entity_id,
    };
    match svc.load_statistics(round_id, &filter) {
        Ok(stats) => match serde_json::to_value(&stats) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
        },
        Err(e) => err(&req.id, e.code(), e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "stats.compute" => Some(handle_compute(state, req)),
        _ => None,
    }
}
