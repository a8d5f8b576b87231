use crate::codec::RoundTree;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::round::{self, RoundError, RoundService};
use crate::store::{RoundStore, SqliteStore};
use serde_json::json;

fn round_err(id: &str, e: RoundError) -> serde_json::Value {
    err(id, e.code(), e.to_string(), None)
}

/// Accepts either `params.roundId` or the `{year, term}` pair the UI
/// works with (year 2567 term 1 -> 25671).
fn parse_round_id(params: &serde_json::Value) -> Option<i64> {
    if let Some(id) = params.get("roundId").and_then(|v| v.as_i64()) {
        return Some(id);
    }
    let year = params.get("year").and_then(|v| v.as_i64())?;
    let term = params.get("term").and_then(|v| v.as_i64())?;
    Some(round::around_id(year, term))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "rounds": [] }));
    };
    let store = SqliteStore::new(conn);
    match store.list_rounds() {
        Ok(rounds) => ok(&req.id, json!({ "rounds": rounds })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(tree_val) = req.params.get("tree") else {
        return err(&req.id, "bad_params", "missing params.tree", None);
    };
    let tree: RoundTree = match serde_json::from_value(tree_val.clone()) {
        Ok(t) => t,
        Err(e) => return err(&req.id, "bad_params", format!("invalid tree: {}", e), None),
    };

    let store = SqliteStore::new(conn);
    let svc = RoundService::new(&store);
    match svc.create(&tree) {
        Ok(()) => ok(&req.id, json!({ "roundId": tree.round_id })),
        Err(e) => round_err(&req.id, e),
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(round_id) = parse_round_id(&req.params) else {
        return err(&req.id, "bad_params", "missing roundId or year/term", None);
    };

    let store = SqliteStore::new(conn);
    let svc = RoundService::new(&store);
    match svc.load_tree(round_id) {
        Ok(loaded) => match serde_json::to_value(&loaded) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
        },
        Err(e) => round_err(&req.id, e),
    }
}

fn handle_replace(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(tree_val) = req.params.get("tree") else {
        return err(&req.id, "bad_params", "missing params.tree", None);
    };
    let tree: RoundTree = match serde_json::from_value(tree_val.clone()) {
        Ok(t) => t,
        Err(e) => return err(&req.id, "bad_params", format!("invalid tree: {}", e), None),
    };
    let clear_answers = req
        .params
        .get("clearAnswers")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let store = SqliteStore::new(conn);
    let svc = RoundService::new(&store);
    match svc.replace(&tree, clear_answers) {
        Ok(()) => ok(&req.id, json!({ "roundId": tree.round_id })),
        Err(e) => round_err(&req.id, e),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(round_id) = parse_round_id(&req.params) else {
        return err(&req.id, "bad_params", "missing roundId or year/term", None);
    };
    let clear_answers = req
        .params
        .get("clearAnswers")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let store = SqliteStore::new(conn);
    let svc = RoundService::new(&store);
    match svc.delete(round_id, clear_answers) {
        Ok(()) => ok(&req.id, json!({ "roundId": round_id })),
        Err(e) => round_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "rounds.list" => Some(handle_list(state, req)),
        "round.create" => Some(handle_create(state, req)),
        "round.get" => Some(handle_get(state, req)),
        "round.replace" => Some(handle_replace(state, req)),
        "round.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
