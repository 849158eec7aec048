//! `roots/list` shapes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Root {
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListRootsResult {
    pub roots: Vec<Root>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn list_roots_result_decodes() {
        let result: ListRootsResult = serde_json::from_value(json!({
            "roots": [{ "uri": "file:///work", "name": "work" }]
        }))
        .expect("decode");
        assert_eq!(result.roots[0].uri, "file:///work");
    }
}
