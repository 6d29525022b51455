use schema::{BatchId, CitizenId, CitizenPatchPayload, CitizenPayload, ImportPayload};
use serde::Serialize;
use serde_json::json;

use super::{
    HttpRequest, HttpResponse,
    middleware::{parse_json_body, require_json, translate_errors},
};
use crate::CensusService;

#[derive(Debug, Serialize)]
struct ImportCreated {
    import_id: BatchId,
}

/// Path without the query string, split into its non-empty segments.
fn path_segments(target: &str) -> Vec<&str> {
    let path = target.split_once('?').map_or(target, |(path, _)| path);
    path.split('/').filter(|segment| !segment.is_empty()).collect()
}

pub fn handle_request(service: &CensusService, request: &HttpRequest) -> HttpResponse {
    let segments = path_segments(&request.target);
    let method = request.method.as_str();
    match segments.as_slice() {
        ["health"] => match method {
            "GET" => HttpResponse::ok_json(json!({ "status": "ok" }).to_string()),
            _ => HttpResponse::method_not_allowed("only GET is supported for /health"),
        },
        ["imports"] => match method {
            "POST" => post_import(service, request),
            _ => HttpResponse::method_not_allowed("only POST is supported for /imports"),
        },
        ["imports", import_id, "citizens"] => match method {
            "GET" => with_import_id(import_id, |batch_id| {
                translate_errors(
                    "list_citizens",
                    200,
                    service.list_citizens(batch_id),
                )
            }),
            _ => HttpResponse::method_not_allowed("only GET is supported for citizens"),
        },
        ["imports", import_id, "citizens", "birthdays"] if method == "GET" => {
            with_import_id(import_id, |batch_id| {
                translate_errors("birthdays", 200, service.gift_months(batch_id))
            })
        }
        ["imports", import_id, "citizens", citizen_id] => match method {
            "PATCH" => with_import_id(import_id, |batch_id| {
                match citizen_id.parse::<CitizenId>() {
                    Ok(citizen_id) => patch_citizen(service, request, batch_id, citizen_id),
                    Err(_) => HttpResponse::not_found("citizen not found"),
                }
            }),
            _ => HttpResponse::method_not_allowed("only PATCH is supported for a citizen"),
        },
        ["imports", import_id, "towns", "stat", "percentile", "age"] => match method {
            "GET" => with_import_id(import_id, |batch_id| {
                translate_errors("age_percentiles", 200, service.age_percentiles(batch_id))
            }),
            _ => HttpResponse::method_not_allowed("only GET is supported for age percentiles"),
        },
        _ => HttpResponse::not_found("route not found"),
    }
}

fn with_import_id(raw: &str, route: impl FnOnce(BatchId) -> HttpResponse) -> HttpResponse {
    match raw.parse::<BatchId>() {
        Ok(batch_id) => route(batch_id),
        Err(_) => HttpResponse::not_found("import not found"),
    }
}

fn post_import(service: &CensusService, request: &HttpRequest) -> HttpResponse {
    if let Err(response) = require_json(request, "POST /imports") {
        return response;
    }
    let citizens = match parse_import_body(request) {
        Ok(citizens) => citizens,
        Err(response) => return response,
    };
    let result = service
        .ingest_payload(citizens)
        .map(|import_id| ImportCreated { import_id });
    translate_errors("import", 201, result)
}

/// Accepts both a bare citizen array and `{"citizens": [...]}`.
fn parse_import_body(request: &HttpRequest) -> Result<Vec<CitizenPayload>, HttpResponse> {
    let first = request
        .body
        .iter()
        .find(|byte| !byte.is_ascii_whitespace());
    if first == Some(&b'[') {
        parse_json_body::<Vec<CitizenPayload>>(request)
    } else {
        parse_json_body::<ImportPayload>(request).map(|payload| payload.citizens)
    }
}

fn patch_citizen(
    service: &CensusService,
    request: &HttpRequest,
    batch_id: BatchId,
    citizen_id: CitizenId,
) -> HttpResponse {
    if let Err(response) = require_json(request, "PATCH /imports/{id}/citizens/{id}") {
        return response;
    }
    let payload = match parse_json_body::<CitizenPatchPayload>(request) {
        Ok(payload) => payload,
        Err(response) => return response,
    };
    translate_errors(
        "patch_citizen",
        200,
        service.patch_payload(batch_id, citizen_id, payload),
    )
}
