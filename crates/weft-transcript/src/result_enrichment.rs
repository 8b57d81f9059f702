//! Post-processing of completed tool results: unwrapping nested
//! serialization and fetching referenced embedded resources.

use serde_json::Value;
use tracing::{debug, warn};
use weft_engine::ResourceFetcher;

use crate::Part;

/// Unwraps a serialized-string result payload into its parsed value.
///
/// Non-string results and strings that do not parse as JSON pass through
/// unchanged.
pub(crate) fn unwrap_result(result: Value) -> Value {
    if let Value::String(text) = &result {
        if let Ok(parsed) = serde_json::from_str::<Value>(text) {
            return parsed;
        }
    }
    result
}

/// Runs the post-processing pass over one assistant message's parts.
///
/// Every invocation part holding a result gets its wrapper unwrapped; parts
/// whose content references embedded resources are enriched through the
/// fetcher when one is configured. Fetch failures are logged and swallowed —
/// the result stays complete without the enrichment.
pub(crate) async fn post_process_parts(parts: &mut [Part], fetcher: Option<&dyn ResourceFetcher>) {
    for part in parts.iter_mut() {
        let Part::ToolInvocation {
            tool_name,
            result: Some(result),
            ..
        } = part
        else {
            continue;
        };

        *result = unwrap_result(std::mem::take(result));

        let Some(fetcher) = fetcher else {
            continue;
        };
        for uri in resource_link_uris(result) {
            match fetcher.fetch(&uri).await {
                Ok(fetched) => {
                    debug!(tool = %tool_name, uri = %uri, "merged embedded resource");
                    merge_fetched_resource(result, fetched);
                }
                Err(error) => {
                    warn!(
                        tool = %tool_name,
                        uri = %uri,
                        error = %error,
                        "embedded resource fetch failed; result kept without enrichment"
                    );
                }
            }
        }
    }
}

/// URIs of `resource_link` items in the result's content list.
fn resource_link_uris(result: &Value) -> Vec<String> {
    let Some(items) = result.get("content").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("resource_link"))
        .filter_map(|item| item.get("uri").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

/// Appends fetched resource content to the result's content list, keeping
/// every already-present item.
fn merge_fetched_resource(result: &mut Value, fetched: Value) {
    let Some(items) = result.get_mut("content").and_then(Value::as_array_mut) else {
        return;
    };
    match fetched.get("contents").and_then(Value::as_array) {
        Some(contents) => items.extend(contents.iter().cloned()),
        None => items.push(fetched),
    }
}
