//! Read-only views of solutions and the aggregation pyramid.

use std::collections::{BTreeMap, HashMap};

use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use uuid::Uuid;

use super::{ApiError, ApiResult, AppState, agent_ref, author_names, parse_id, resolve_problem_id};
use crate::store::SolutionFilter;
use crate::swarm::model::Solution;

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    problem_id: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
    level: Option<u32>,
}

/// Level-1 solutions, newest first.
pub async fn list_solutions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let problem_id = resolve_problem_id(state.db.as_ref(), query.problem_id.as_deref()).await?;
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0);
    let filter = SolutionFilter {
        level: Some(1),
        limit: Some(limit),
        offset,
        ..SolutionFilter::default()
    };

    let solutions = state.db.list_solutions(problem_id, &filter).await?;
    let total = state.db.count_solutions(problem_id, &filter).await?;
    let names = author_names(state.db.as_ref(), &solutions).await?;

    let items: Vec<serde_json::Value> = solutions
        .iter()
        .map(|s| {
            serde_json::json!({
                "id": s.id,
                "agent": agent_ref(&names, s.agent_id),
                "content": s.content,
                "answer": s.answer,
                "confidence": s.confidence,
                "createdAt": s.created_at,
                "isAggregated": s.state.aggregated_into().is_some(),
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "success": true,
        "solutions": items,
        "pagination": {
            "total": total,
            "limit": limit,
            "offset": offset,
        },
    })))
}

/// One solution with its parents and the synthesis that consumed it.
/// Only solutions of the active problem are visible.
pub async fn get_solution(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let id = parse_id(&id, "solution")?;
    let solution = state
        .db
        .get_solution(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Solution not found"))?;

    let problem = state
        .db
        .get_problem(solution.problem_id)
        .await?
        .filter(|p| p.is_active)
        .ok_or_else(|| ApiError::not_found("Solution not found or problem not active"))?;

    let parents = state.db.get_solutions_by_ids(&solution.parent_ids).await?;
    let mut names = author_names(state.db.as_ref(), &parents).await?;
    names.extend(author_names(state.db.as_ref(), std::slice::from_ref(&solution)).await?);

    let aggregated_into = match solution.state.aggregated_into() {
        Some(child_id) => state
            .db
            .get_solution(child_id)
            .await?
            .map(|c| serde_json::json!({"id": c.id, "level": c.level})),
        None => None,
    };

    let parents: Vec<serde_json::Value> = parents
        .iter()
        .map(|p| {
            serde_json::json!({
                "id": p.id,
                "level": p.level,
                "agentName": names.get(&p.agent_id).cloned().unwrap_or_default(),
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "success": true,
        "solution": {
            "id": solution.id,
            "level": solution.level,
            "agent": agent_ref(&names, solution.agent_id),
            "problem": {"id": problem.id, "title": problem.title},
            "content": solution.content,
            "answer": solution.answer,
            "confidence": solution.confidence,
            "isFinal": solution.is_final,
            "createdAt": solution.created_at,
            "parents": parents,
            "aggregatedInto": aggregated_into,
        },
    })))
}

/// Syntheses (level > 1) grouped by level, highest first.
pub async fn list_aggregations(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let problem_id = resolve_problem_id(state.db.as_ref(), query.problem_id.as_deref()).await?;
    let filter = match query.level {
        Some(level) => SolutionFilter {
            level: Some(level),
            ..SolutionFilter::default()
        },
        None => SolutionFilter {
            above_level: Some(1),
            ..SolutionFilter::default()
        },
    };

    let aggregations = state.db.list_solutions(problem_id, &filter).await?;
    let names = author_names(state.db.as_ref(), &aggregations).await?;

    let mut by_level: BTreeMap<u32, Vec<serde_json::Value>> = BTreeMap::new();
    for agg in &aggregations {
        by_level.entry(agg.level).or_default().push(serde_json::json!({
            "id": agg.id,
            "agent": agent_ref(&names, agg.agent_id),
            "content": agg.content,
            "answer": agg.answer,
            "confidence": agg.confidence,
            "parentCount": agg.parent_ids.len(),
            "isFinal": agg.is_final,
            "createdAt": agg.created_at,
        }));
    }
    let level_stats = state.db.level_counts(problem_id).await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "aggregationsByLevel": by_level,
        "levelStats": level_stats,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemQuery {
    problem_id: Option<String>,
}

/// The final answer, or the highest synthesis so far.
pub async fn final_answer(
    State(state): State<AppState>,
    Query(query): Query<ProblemQuery>,
) -> ApiResult {
    let problem_id = resolve_problem_id(state.db.as_ref(), query.problem_id.as_deref()).await?;

    if let Some(final_solution) = state.db.get_final_solution(problem_id).await? {
        let names = author_names(state.db.as_ref(), std::slice::from_ref(&final_solution)).await?;
        let problem = state.db.get_problem(problem_id).await?;
        return Ok(Json(serde_json::json!({
            "success": true,
            "final": {
                "id": final_solution.id,
                "level": final_solution.level,
                "agent": agent_ref(&names, final_solution.agent_id),
                "problem": problem.map(|p| serde_json::json!({"id": p.id, "title": p.title})),
                "content": final_solution.content,
                "answer": final_solution.answer,
                "confidence": final_solution.confidence,
                "createdAt": final_solution.created_at,
            },
        })));
    }

    let highest = state
        .db
        .get_highest_level_solution(problem_id)
        .await?
        .filter(|s| s.level > 1);
    let Some(highest) = highest else {
        return Ok(Json(serde_json::json!({
            "success": true,
            "final": null,
            "message": "No aggregation completed yet",
        })));
    };

    let names = author_names(state.db.as_ref(), std::slice::from_ref(&highest)).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "final": null,
        "highestLevel": {
            "id": highest.id,
            "level": highest.level,
            "agent": agent_ref(&names, highest.agent_id),
            "content": highest.content,
            "answer": highest.answer,
            "confidence": highest.confidence,
            "createdAt": highest.created_at,
        },
        "message": "Final not yet determined. Showing highest level aggregation.",
    })))
}

/// Lineage of the whole problem.
///
/// Roots are solutions nothing has consumed yet (the top of each pyramid);
/// a node's children are the solutions it was synthesized from.
pub async fn aggregation_tree(
    State(state): State<AppState>,
    Query(query): Query<ProblemQuery>,
) -> ApiResult {
    let problem_id = resolve_problem_id(state.db.as_ref(), query.problem_id.as_deref()).await?;
    let solutions = state
        .db
        .list_solutions(problem_id, &SolutionFilter::default())
        .await?;
    let names = author_names(state.db.as_ref(), &solutions).await?;
    let by_id: HashMap<Uuid, &Solution> = solutions.iter().map(|s| (s.id, s)).collect();

    let roots: Vec<serde_json::Value> = solutions
        .iter()
        .filter(|s| s.state.aggregated_into().is_none())
        .map(|s| tree_node(s, &by_id, &names))
        .collect();

    let mut level_counts: BTreeMap<u32, usize> = BTreeMap::new();
    for s in &solutions {
        *level_counts.entry(s.level).or_default() += 1;
    }

    Ok(Json(serde_json::json!({
        "success": true,
        "tree": {
            "roots": roots,
            "levelCounts": level_counts,
            "totalSolutions": solutions.len(),
        },
    })))
}

fn tree_node(
    solution: &Solution,
    by_id: &HashMap<Uuid, &Solution>,
    names: &HashMap<Uuid, String>,
) -> serde_json::Value {
    let children: Vec<serde_json::Value> = solution
        .parent_ids
        .iter()
        .filter_map(|id| by_id.get(id))
        .map(|parent| tree_node(parent, by_id, names))
        .collect();

    serde_json::json!({
        "id": solution.id,
        "level": solution.level,
        "agent": agent_ref(names, solution.agent_id),
        "answer": solution.answer,
        "confidence": solution.confidence,
        "isFinal": solution.is_final,
        "children": children,
    })
}
