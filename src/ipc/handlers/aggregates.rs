use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::rollup::AggregateRow;
use crate::store::{AnswerRow, RoundStore, SqliteStore};
use serde_json::json;

/// Ingress for the external recompute job's output: aggregate rows are
/// only ever replaced wholesale for a round, never patched.
fn handle_aggregates_replace(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(round_id) = req.params.get("roundId").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing roundId", None);
    };
    let Some(rows_val) = req.params.get("rows") else {
        return err(&req.id, "bad_params", "missing params.rows", None);
    };
    let rows: Vec<AggregateRow> = match serde_json::from_value(rows_val.clone()) {
        Ok(r) => r,
        Err(e) => {
            return err(
                &req.id,
                "bad_params",
                format!("invalid aggregate rows: {}", e),
                None,
            )
        }
    };

    let store = SqliteStore::new(conn);
    match store.replace_aggregates(round_id, &rows) {
        Ok(()) => ok(&req.id, json!({ "roundId": round_id, "count": rows.len() })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_answers_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(round_id) = req.params.get("roundId").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing roundId", None);
    };
    let Some(answers_val) = req.params.get("answers") else {
        return err(&req.id, "bad_params", "missing params.answers", None);
    };
    let answers: Vec<AnswerRow> = match serde_json::from_value(answers_val.clone()) {
        Ok(a) => a,
        Err(e) => {
            return err(
                &req.id,
                "bad_params",
                format!("invalid answers: {}", e),
                None,
            )
        }
    };

    let store = SqliteStore::new(conn);
    match store.insert_answers(round_id, &answers) {
        Ok(()) => ok(
            &req.id,
            json!({ "roundId": round_id, "count": answers.len() }),
        ),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "aggregates.replace" => Some(handle_aggregates_replace(state, req)),
        "answers.add" => Some(handle_answers_add(state, req)),
        _ => None,
    }
}
