//! Experience tools: role-scoped long-term memory the model can curate.
//!
//! All six tools share one binding of `(user_id, role_id, store)`. An
//! experience not linked to the bound role is reported as not found.

use std::sync::Arc;

use async_trait::async_trait;
use cortex_core::error::{StoreError, ToolError};
use cortex_core::store::{ExperienceQuery, ExperienceStore, tokenize_keywords};
use cortex_core::tool::Tool;
use cortex_core::Experience;
use tracing::debug;

pub const CREATE: &str = "create_experience";
pub const UPDATE: &str = "update_experience";
pub const DELETE: &str = "delete_experience";
pub const GET: &str = "get_experience";
pub const SEARCH: &str = "search_experience";
pub const FUZZY_SEARCH: &str = "fuzzy_search_experience";

const DEFAULT_FUZZY_LIMIT: u32 = 10;
const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Create,
    Update,
    Delete,
    Get,
    Search,
    FuzzySearch,
}

struct Binding {
    user_id: String,
    role_id: String,
    store: Arc<dyn ExperienceStore>,
}

pub struct ExperienceTool {
    op: Op,
    binding: Arc<Binding>,
}

/// The six experience tools, in binding order.
pub fn experience_tools(
    user_id: impl Into<String>,
    role_id: impl Into<String>,
    store: Arc<dyn ExperienceStore>,
) -> Vec<Arc<dyn Tool>> {
    let binding = Arc::new(Binding {
        user_id: user_id.into(),
        role_id: role_id.into(),
        store,
    });
    [Op::Create, Op::Update, Op::Delete, Op::Get, Op::Search, Op::FuzzySearch]
        .into_iter()
        .map(|op| {
            Arc::new(ExperienceTool {
                op,
                binding: binding.clone(),
            }) as Arc<dyn Tool>
        })
        .collect()
}

fn store_err(tool: &str, e: StoreError) -> ToolError {
    match e {
        StoreError::NotFound(what) => ToolError::ExecutionFailed {
            tool_name: tool.into(),
            reason: format!("Experience not found: {what}"),
        },
        other => ToolError::ExecutionFailed {
            tool_name: tool.into(),
            reason: other.to_string(),
        },
    }
}

fn str_arg<'a>(args: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    args[key].as_str().map(str::trim).filter(|s| !s.is_empty())
}

fn required<'a>(args: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolError> {
    str_arg(args, key).ok_or_else(|| ToolError::InvalidArguments(format!("Missing '{key}' argument")))
}

fn tags_arg(args: &serde_json::Value) -> Option<Vec<String>> {
    args["tags"].as_array().map(|tags| {
        tags.iter()
            .filter_map(|t| t.as_str())
            .map(str::to_string)
            .collect()
    })
}

fn keywords_arg(args: &serde_json::Value) -> Vec<String> {
    match &args["keywords"] {
        serde_json::Value::Array(items) => {
            let raw: Vec<&str> = items.iter().filter_map(|v| v.as_str()).collect();
            tokenize_keywords(&raw)
        }
        serde_json::Value::String(s) => tokenize_keywords(&[s.as_str()]),
        _ => Vec::new(),
    }
}

impl ExperienceTool {
    async fn linked(&self, id: &str) -> Result<Experience, ToolError> {
        let b = &self.binding;
        let linked = b
            .store
            .is_linked(&b.role_id, id)
            .await
            .map_err(|e| store_err(self.name(), e))?;
        if !linked {
            return Err(store_err(self.name(), StoreError::NotFound(id.to_string())));
        }
        b.store
            .get_experience(id)
            .await
            .map_err(|e| store_err(self.name(), e))
    }

    async fn run(&self, args: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let b = &self.binding;
        let name = self.name();
        match self.op {
            Op::Create => {
                let mut exp = Experience::new(
                    str_arg(&args, "type").unwrap_or("general"),
                    required(&args, "title")?,
                    required(&args, "content")?,
                    &b.user_id,
                );
                exp.tags = tags_arg(&args).unwrap_or_default();
                b.store
                    .create_experience(&exp)
                    .await
                    .map_err(|e| store_err(name, e))?;
                b.store
                    .link_role(&b.role_id, &exp.id)
                    .await
                    .map_err(|e| store_err(name, e))?;
                debug!(experience_id = %exp.id, role_id = %b.role_id, "Experience created");
                Ok(serde_json::json!({ "id": exp.id, "created": true }))
            }
            Op::Update => {
                let mut exp = self.linked(required(&args, "id")?).await?;
                if let Some(kind) = str_arg(&args, "type") {
                    exp.kind = kind.to_string();
                }
                if let Some(title) = str_arg(&args, "title") {
                    exp.title = title.to_string();
                }
                if let Some(content) = str_arg(&args, "content") {
                    exp.content = content.to_string();
                }
                if let Some(tags) = tags_arg(&args) {
                    exp.tags = tags;
                }
                exp.updated_at = chrono::Utc::now();
                b.store
                    .update_experience(&exp)
                    .await
                    .map_err(|e| store_err(name, e))?;
                Ok(serde_json::json!({ "id": exp.id, "updated": true }))
            }
            Op::Delete => {
                let exp = self.linked(required(&args, "id")?).await?;
                b.store
                    .delete_experience(&exp.id)
                    .await
                    .map_err(|e| store_err(name, e))?;
                Ok(serde_json::json!({ "id": exp.id, "deleted": true }))
            }
            Op::Get => {
                let exp = self.linked(required(&args, "id")?).await?;
                serde_json::to_value(exp).map_err(|e| store_err(name, StoreError::Serialization(e.to_string())))
            }
            Op::Search => {
                let query = ExperienceQuery {
                    kind: str_arg(&args, "type").map(str::to_string),
                    title: str_arg(&args, "title").map(str::to_string),
                    tag: str_arg(&args, "tag").map(str::to_string),
                    created_by: str_arg(&args, "created_by").map(str::to_string),
                    page: args["page"].as_u64().map(|p| p.max(1) as u32).unwrap_or(1),
                    page_size: args["page_size"]
                        .as_u64()
                        .map(|p| (p as u32).clamp(1, MAX_PAGE_SIZE))
                        .unwrap_or(10),
                };
                let (items, total) = b
                    .store
                    .search_experiences(&b.role_id, &query)
                    .await
                    .map_err(|e| store_err(name, e))?;
                Ok(serde_json::json!({
                    "items": items,
                    "total": total,
                    "page": query.page,
                    "page_size": query.page_size,
                }))
            }
            Op::FuzzySearch => {
                let keywords = keywords_arg(&args);
                if keywords.is_empty() {
                    return Err(ToolError::InvalidArguments("'keywords' must contain at least one word".into()));
                }
                let limit = args["limit"]
                    .as_u64()
                    .map(|l| (l as u32).clamp(1, MAX_PAGE_SIZE))
                    .unwrap_or(DEFAULT_FUZZY_LIMIT);
                let items = b
                    .store
                    .fuzzy_search(&b.role_id, &keywords, limit)
                    .await
                    .map_err(|e| store_err(name, e))?;
                Ok(serde_json::json!({ "items": items, "count": items.len() }))
            }
        }
    }
}

#[async_trait]
impl Tool for ExperienceTool {
    fn name(&self) -> &str {
        match self.op {
            Op::Create => CREATE,
            Op::Update => UPDATE,
            Op::Delete => DELETE,
            Op::Get => GET,
            Op::Search => SEARCH,
            Op::FuzzySearch => FUZZY_SEARCH,
        }
    }

    fn description(&self) -> &str {
        match self.op {
            Op::Create => "Save a new experience (a reusable lesson, procedure or fact) for this role.",
            Op::Update => "Update fields of an existing experience by id.",
            Op::Delete => "Delete an experience by id.",
            Op::Get => "Fetch one experience by id.",
            Op::Search => "Search experiences by type, title, tag or creator, with pagination.",
            Op::FuzzySearch => {
                "Find experiences whose title or content contains any of the given keywords. \
                 Use this before answering to recall relevant past experience."
            }
        }
    }

    fn parameters_schema(&self) -> serde_json::Value {
        let id = serde_json::json!({ "type": "string", "description": "Experience id" });
        let tags = serde_json::json!({ "type": "array", "items": { "type": "string" } });
        match self.op {
            Op::Create => serde_json::json!({
                "type": "object",
                "properties": {
                    "type": { "type": "string", "description": "Category, e.g. 'procedure'" },
                    "title": { "type": "string" },
                    "content": { "type": "string" },
                    "tags": tags
                },
                "required": ["title", "content"]
            }),
            Op::Update => serde_json::json!({
                "type": "object",
                "properties": {
                    "id": id,
                    "type": { "type": "string" },
                    "title": { "type": "string" },
                    "content": { "type": "string" },
                    "tags": tags
                },
                "required": ["id"]
            }),
            Op::Delete | Op::Get => serde_json::json!({
                "type": "object",
                "properties": { "id": id },
                "required": ["id"]
            }),
            Op::Search => serde_json::json!({
                "type": "object",
                "properties": {
                    "type": { "type": "string" },
                    "title": { "type": "string", "description": "Substring of the title" },
                    "tag": { "type": "string" },
                    "created_by": { "type": "string" },
                    "page": { "type": "integer", "minimum": 1 },
                    "page_size": { "type": "integer", "minimum": 1, "maximum": MAX_PAGE_SIZE }
                }
            }),
            Op::FuzzySearch => serde_json::json!({
                "type": "object",
                "properties": {
                    "keywords": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Keywords; each entry is split on whitespace"
                    },
                    "limit": { "type": "integer", "minimum": 1 }
                },
                "required": ["keywords"]
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        self.run(arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Minimal store: experiences plus role links, no pagination subtleties.
    #[derive(Default)]
    struct MapStore {
        items: Mutex<HashMap<String, Experience>>,
        links: Mutex<Vec<(String, String)>>,
    }

    type R<T> = Result<T, StoreError>;

    #[async_trait]
    impl ExperienceStore for MapStore {
        async fn create_experience(&self, e: &Experience) -> R<()> {
            self.items.lock().unwrap().insert(e.id.clone(), e.clone());
            Ok(())
        }
        async fn get_experience(&self, id: &str) -> R<Experience> {
            self.items
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(id.into()))
        }
        async fn update_experience(&self, e: &Experience) -> R<()> {
            self.create_experience(e).await
        }
        async fn delete_experience(&self, id: &str) -> R<()> {
            self.items.lock().unwrap().remove(id);
            self.links.lock().unwrap().retain(|(_, e)| e != id);
            Ok(())
        }
        async fn link_role(&self, role: &str, id: &str) -> R<()> {
            self.links.lock().unwrap().push((role.into(), id.into()));
            Ok(())
        }
        async fn is_linked(&self, role: &str, id: &str) -> R<bool> {
            Ok(self.links.lock().unwrap().iter().any(|(r, e)| r == role && e == id))
        }
        async fn list_for_role(&self, role: &str) -> R<Vec<Experience>> {
            let links = self.links.lock().unwrap().clone();
            let items = self.items.lock().unwrap();
            Ok(links
                .iter()
                .filter(|(r, _)| r == role)
                .filter_map(|(_, e)| items.get(e).cloned())
                .collect())
        }
        async fn search_experiences(&self, role: &str, q: &ExperienceQuery) -> R<(Vec<Experience>, u64)> {
            let all: Vec<_> = self
                .list_for_role(role)
                .await?
                .into_iter()
                .filter(|e| q.tag.as_ref().is_none_or(|t| e.tags.contains(t)))
                .collect();
            let total = all.len() as u64;
            Ok((all, total))
        }
        async fn fuzzy_search(&self, role: &str, kws: &[String], limit: u32) -> R<Vec<Experience>> {
            Ok(self
                .list_for_role(role)
                .await?
                .into_iter()
                .filter(|e| kws.iter().any(|k| e.title.contains(k) || e.content.contains(k)))
                .take(limit as usize)
                .collect())
        }
    }

    fn tool<'a>(tools: &'a [Arc<dyn Tool>], name: &str) -> &'a Arc<dyn Tool> {
        tools.iter().find(|t| t.name() == name).unwrap()
    }

    #[test]
    fn binding_order() {
        let tools = experience_tools("u", "r", Arc::new(MapStore::default()));
        let names: Vec<&str> = tools.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec![CREATE, UPDATE, DELETE, GET, SEARCH, FUZZY_SEARCH]);
    }

    #[tokio::test]
    async fn crud_round_trip_within_role() {
        let store = Arc::new(MapStore::default());
        let tools = experience_tools("u1", "r1", store.clone());

        let created = tool(&tools, CREATE)
            .execute(serde_json::json!({
                "type": "procedure", "title": "Rollback", "content": "kubectl rollout undo", "tags": ["k8s"]
            }))
            .await
            .unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        tool(&tools, UPDATE)
            .execute(serde_json::json!({"id": id, "content": "helm rollback"}))
            .await
            .unwrap();
        let got = tool(&tools, GET).execute(serde_json::json!({"id": id})).await.unwrap();
        assert_eq!(got["content"], "helm rollback");
        assert_eq!(got["type"], "procedure");
        assert_eq!(got["created_by"], "u1");

        let found = tool(&tools, FUZZY_SEARCH)
            .execute(serde_json::json!({"keywords": ["nothing helm"]}))
            .await
            .unwrap();
        assert_eq!(found["count"], 1);

        let page = tool(&tools, SEARCH)
            .execute(serde_json::json!({"tag": "k8s"}))
            .await
            .unwrap();
        assert_eq!(page["total"], 1);

        tool(&tools, DELETE).execute(serde_json::json!({"id": id})).await.unwrap();
        assert!(tool(&tools, GET).execute(serde_json::json!({"id": id})).await.is_err());
    }

    #[tokio::test]
    async fn other_roles_cannot_see_experience() {
        let store = Arc::new(MapStore::default());
        let mine = experience_tools("u1", "r1", store.clone());
        let theirs = experience_tools("u1", "r2", store.clone());

        let created = tool(&mine, CREATE)
            .execute(serde_json::json!({"title": "t", "content": "c"}))
            .await
            .unwrap();
        let id = created["id"].as_str().unwrap();

        let err = tool(&theirs, GET).execute(serde_json::json!({"id": id})).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert!(tool(&theirs, DELETE).execute(serde_json::json!({"id": id})).await.is_err());
        assert!(tool(&mine, GET).execute(serde_json::json!({"id": id})).await.is_ok());
    }

    #[tokio::test]
    async fn argument_validation() {
        let tools = experience_tools("u", "r", Arc::new(MapStore::default()));
        assert!(matches!(
            tool(&tools, CREATE).execute(serde_json::json!({"title": "x"})).await,
            Err(ToolError::InvalidArguments(_))
        ));
        assert!(matches!(
            tool(&tools, FUZZY_SEARCH).execute(serde_json::json!({"keywords": ["  "]})).await,
            Err(ToolError::InvalidArguments(_))
        ));
    }
}
