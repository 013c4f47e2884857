//! Agent directory
//!
//! Local and external agent sources normalized to one `Agent` record, plus
//! the pure scoring selector. The external source talks to a CRM over REST
//! or direct SQL with configurable field mappings and caches its listing
//! for five minutes.

use crate::store::SessionStore;
use async_trait::async_trait;
use chatforge_common::cache::TtlCache;
use chatforge_common::config::ExternalAgentConfig;
use chatforge_common::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const EXTERNAL_CACHE_TTL: Duration = Duration::from_secs(300);

/// Where an agent record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentSourceKind {
    Local,
    External,
}

impl AgentSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentSourceKind::Local => "local",
            AgentSourceKind::External => "external",
        }
    }
}

/// The normalized agent record the selector works on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub source: AgentSourceKind,
    pub name: String,
    pub email: String,
    pub status: String,
    pub max_concurrent: i32,
    pub current_load: i32,
    pub department: Option<String>,
    pub skills: Vec<String>,
}

impl Agent {
    pub fn is_available(&self) -> bool {
        self.status == "online" && self.current_load < self.max_concurrent
    }
}

/// Capability set of one agent backend.
#[async_trait]
pub trait AgentSource: Send + Sync {
    /// Available agents of a tenant.
    async fn list(&self, tenant: &str) -> Result<Vec<Agent>>;

    /// Adjust an agent's load by a delta.
    async fn update_load(&self, agent_id: &str, delta: i32) -> Result<()>;

    fn kind(&self) -> AgentSourceKind;
}

// ============================================================================
// Local source
// ============================================================================

/// Agents from the local users table.
pub struct LocalAgentSource {
    store: Arc<dyn SessionStore>,
}

impl LocalAgentSource {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AgentSource for LocalAgentSource {
    async fn list(&self, tenant: &str) -> Result<Vec<Agent>> {
        let users = self.store.list_available_agents(tenant).await?;
        Ok(users
            .into_iter()
            .map(|u| Agent {
                id: u.id.to_string(),
                source: AgentSourceKind::Local,
                name: u.name.clone(),
                email: u.email.clone(),
                status: u.status.clone(),
                max_concurrent: u.max_concurrent,
                current_load: u.current_load,
                department: u.department.clone(),
                skills: u.skill_list(),
            })
            .collect())
    }

    async fn update_load(&self, agent_id: &str, delta: i32) -> Result<()> {
        let id = agent_id.parse().map_err(|_| AppError::Validation {
            message: format!("invalid local agent id: {agent_id}"),
            field: Some("agent_id".to_string()),
        })?;
        self.store.adjust_user_load(id, delta).await?;
        Ok(())
    }

    fn kind(&self) -> AgentSourceKind {
        AgentSourceKind::Local
    }
}

// ============================================================================
// External source (REST)
// ============================================================================

/// Agents fetched from an external CRM API, normalized through the
/// configured field mappings and cached.
pub struct ExternalAgentSource {
    client: reqwest::Client,
    config: ExternalAgentConfig,
    cache: TtlCache<String, Vec<Agent>>,
}

impl ExternalAgentSource {
    pub fn new(config: ExternalAgentConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            config,
            cache: TtlCache::new(EXTERNAL_CACHE_TTL, 64),
        }
    }

    fn api_url(&self) -> Result<&str> {
        self.config
            .api_url
            .as_deref()
            .ok_or_else(|| AppError::Configuration {
                message: "EXTERNAL_AGENT_API_URL is not set".to_string(),
            })
    }

    /// Map one raw row onto the normalized shape.
    fn normalize(&self, row: &Value) -> Option<Agent> {
        let fields = &self.config.fields;
        let s = |key: &String| row.get(key).and_then(|v| v.as_str()).map(String::from);
        let n = |key: &String| {
            row.get(key)
                .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        };

        let id = s(&fields.id).or_else(|| n(&fields.id).map(|v| v.to_string()))?;
        let email = s(&fields.email)?;

        let skills = match row.get(&fields.skills) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            Some(Value::String(csv)) => csv
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            _ => Vec::new(),
        };

        Some(Agent {
            id,
            source: AgentSourceKind::External,
            name: s(&fields.name).unwrap_or_else(|| email.clone()),
            email,
            status: s(&fields.status).unwrap_or_else(|| "offline".to_string()).to_lowercase(),
            max_concurrent: n(&fields.max_concurrent).unwrap_or(1) as i32,
            current_load: n(&fields.current_load).unwrap_or(0) as i32,
            department: s(&fields.department),
            skills,
        })
    }

    async fn fetch(&self, tenant: &str) -> Result<Vec<Agent>> {
        let url = format!("{}/agents?tenant={tenant}", self.api_url()?);

        let mut request = self.client.get(&url);
        if let Some(ref key) = self.config.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await.map_err(|e| AppError::ExternalAgent {
            message: format!("agent fetch failed: {e}"),
        })?;

        if !response.status().is_success() {
            return Err(AppError::ExternalAgent {
                message: format!("agent API error {}", response.status()),
            });
        }

        let rows: Vec<Value> = response.json().await.map_err(|e| AppError::ExternalAgent {
            message: format!("bad agent payload: {e}"),
        })?;

        let agents: Vec<Agent> = rows
            .iter()
            .filter_map(|row| self.normalize(row))
            .filter(|a| a.is_available())
            .collect();

        debug!(tenant, count = agents.len(), "External agents fetched");
        Ok(agents)
    }
}

#[async_trait]
impl AgentSource for ExternalAgentSource {
    async fn list(&self, tenant: &str) -> Result<Vec<Agent>> {
        let key = tenant.to_string();
        if let Some(cached) = self.cache.get(&key).await {
            return Ok(cached);
        }
        let agents = self.fetch(tenant).await?;
        self.cache.set(key, agents.clone()).await;
        Ok(agents)
    }

    async fn update_load(&self, agent_id: &str, delta: i32) -> Result<()> {
        let url = format!("{}/agents/{agent_id}/load", self.api_url()?);

        let mut request = self
            .client
            .patch(&url)
            .json(&serde_json::json!({ "delta": delta }));
        if let Some(ref key) = self.config.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await.map_err(|e| AppError::ExternalAgent {
            message: format!("load update failed: {e}"),
        })?;
        if !response.status().is_success() {
            return Err(AppError::ExternalAgent {
                message: format!("load update error {}", response.status()),
            });
        }

        // Listings reflect the change on next fetch.
        self.cache.invalidate_all().await;
        Ok(())
    }

    fn kind(&self) -> AgentSourceKind {
        AgentSourceKind::External
    }
}

// ============================================================================
// External source (direct SQL)
// ============================================================================

/// Agents read straight from a CRM database table. Field mappings name the
/// columns; rows are normalized like the REST variant and cached.
pub struct ExternalSqlAgentSource {
    db: sea_orm::DatabaseConnection,
    config: ExternalAgentConfig,
    cache: TtlCache<String, Vec<Agent>>,
}

impl ExternalSqlAgentSource {
    pub async fn connect(config: ExternalAgentConfig) -> Result<Self> {
        let uri = config.db_uri.as_deref().ok_or_else(|| AppError::Configuration {
            message: "EXTERNAL_AGENT_DB_URI is not set".to_string(),
        })?;

        let db = sea_orm::Database::connect(uri)
            .await
            .map_err(|e| AppError::ExternalAgent {
                message: format!("agent DB connect failed: {e}"),
            })?;

        Ok(Self {
            db,
            config,
            cache: TtlCache::new(EXTERNAL_CACHE_TTL, 64),
        })
    }
}

#[async_trait]
impl AgentSource for ExternalSqlAgentSource {
    async fn list(&self, tenant: &str) -> Result<Vec<Agent>> {
        use sea_orm::{ConnectionTrait, Statement};

        let key = tenant.to_string();
        if let Some(cached) = self.cache.get(&key).await {
            return Ok(cached);
        }

        let f = &self.config.fields;
        let sql = format!(
            "SELECT {id}, {name}, {email}, {status}, {max}, {load}, {dept}, {skills} FROM {table}",
            id = f.id,
            name = f.name,
            email = f.email,
            status = f.status,
            max = f.max_concurrent,
            load = f.current_load,
            dept = f.department,
            skills = f.skills,
            table = self.config.table_name,
        );

        let rows = self
            .db
            .query_all(Statement::from_string(self.db.get_database_backend(), sql))
            .await
            .map_err(|e| AppError::ExternalAgent {
                message: format!("agent query failed: {e}"),
            })?;

        let mut agents = Vec::with_capacity(rows.len());
        for row in rows {
            let get_s = |col: &str| row.try_get::<String>("", col).ok();
            let get_i = |col: &str| {
                row.try_get::<i32>("", col)
                    .ok()
                    .or_else(|| row.try_get::<i64>("", col).ok().map(|v| v as i32))
            };

            let Some(id) = get_s(&f.id).or_else(|| get_i(&f.id).map(|v| v.to_string())) else {
                continue;
            };
            let Some(email) = get_s(&f.email) else {
                continue;
            };

            let agent = Agent {
                id,
                source: AgentSourceKind::External,
                name: get_s(&f.name).unwrap_or_else(|| email.clone()),
                email,
                status: get_s(&f.status).unwrap_or_else(|| "offline".into()).to_lowercase(),
                max_concurrent: get_i(&f.max_concurrent).unwrap_or(1),
                current_load: get_i(&f.current_load).unwrap_or(0),
                department: get_s(&f.department),
                skills: get_s(&f.skills)
                    .map(|csv| {
                        csv.split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect()
                    })
                    .unwrap_or_default(),
            };
            if agent.is_available() {
                agents.push(agent);
            }
        }

        self.cache.set(key, agents.clone()).await;
        Ok(agents)
    }

    async fn update_load(&self, agent_id: &str, delta: i32) -> Result<()> {
        use sea_orm::{ConnectionTrait, DbBackend, Statement};

        let backend = self.db.get_database_backend();
        // Identifiers come from config; values are bound.
        let (p1, p2) = match backend {
            DbBackend::MySql => ("?", "?"),
            _ => ("$1", "$2"),
        };

        let f = &self.config.fields;
        let sql = format!(
            "UPDATE {table} SET {load} = GREATEST({load} + {p1}, 0) WHERE {id} = {p2}",
            table = self.config.table_name,
            load = f.current_load,
            id = f.id,
        );

        self.db
            .execute(Statement::from_sql_and_values(
                backend,
                sql,
                vec![delta.into(), agent_id.into()],
            ))
            .await
            .map_err(|e| AppError::ExternalAgent {
                message: format!("agent load update failed: {e}"),
            })?;

        self.cache.invalidate_all().await;
        Ok(())
    }

    fn kind(&self) -> AgentSourceKind {
        AgentSourceKind::External
    }
}

// ============================================================================
// Selector
// ============================================================================

/// What the caller is routing on.
#[derive(Debug, Clone, Default)]
pub struct SelectionCriteria {
    pub department: Option<String>,
    pub required_skills: Vec<String>,
}

/// Score and pick the best candidate.
///
/// `score = (1 − load/max)·100 + skill_matches·20 + department·30 +
/// local-preference·10`; ties break on lowest load, then agent id.
pub fn select_agent(
    candidates: &[Agent],
    criteria: &SelectionCriteria,
    prefer_local: bool,
) -> Option<Agent> {
    let score = |agent: &Agent| -> f64 {
        let capacity = if agent.max_concurrent > 0 {
            1.0 - agent.current_load as f64 / agent.max_concurrent as f64
        } else {
            0.0
        };
        let skill_matches = criteria
            .required_skills
            .iter()
            .filter(|s| agent.skills.iter().any(|have| have.eq_ignore_ascii_case(s)))
            .count() as f64;
        let department = match (&criteria.department, &agent.department) {
            (Some(want), Some(have)) if want.eq_ignore_ascii_case(have) => 30.0,
            _ => 0.0,
        };
        let local = if prefer_local && agent.source == AgentSourceKind::Local {
            10.0
        } else {
            0.0
        };

        capacity * 100.0 + skill_matches * 20.0 + department + local
    };

    candidates
        .iter()
        .filter(|a| a.is_available())
        .max_by(|a, b| {
            score(a)
                .partial_cmp(&score(b))
                .unwrap_or(std::cmp::Ordering::Equal)
                // Ties: lowest load wins, then deterministic by id.
                .then_with(|| b.current_load.cmp(&a.current_load))
                .then_with(|| b.id.cmp(&a.id))
        })
        .cloned()
}

// ============================================================================
// Directory facade
// ============================================================================

/// Union of the configured sources plus the selector.
pub struct AgentDirectory {
    sources: Vec<Arc<dyn AgentSource>>,
    prefer_local: bool,
}

impl AgentDirectory {
    pub fn new(sources: Vec<Arc<dyn AgentSource>>, prefer_local: bool) -> Self {
        Self {
            sources,
            prefer_local,
        }
    }

    /// All available candidates. A failing source is skipped after logging
    /// so an unreachable CRM never blocks local routing.
    pub async fn candidates(&self, tenant: &str) -> Vec<Agent> {
        let mut all = Vec::new();
        for source in &self.sources {
            match source.list(tenant).await {
                Ok(agents) => all.extend(agents),
                Err(e) => {
                    warn!(source = source.kind().as_str(), error = %e, "Agent source failed");
                }
            }
        }
        all
    }

    /// Pick the best available agent for the criteria.
    pub async fn select(&self, tenant: &str, criteria: &SelectionCriteria) -> Option<Agent> {
        let candidates = self.candidates(tenant).await;
        select_agent(&candidates, criteria, self.prefer_local)
    }

    /// Route a load adjustment to the agent's source.
    pub async fn update_load(&self, agent: &Agent, delta: i32) -> Result<()> {
        for source in &self.sources {
            if source.kind() == agent.source {
                return source.update_load(&agent.id, delta).await;
            }
        }
        Err(AppError::Internal {
            message: format!("no source registered for {:?}", agent.source),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str, source: AgentSourceKind, load: i32, max: i32) -> Agent {
        Agent {
            id: id.to_string(),
            source,
            name: format!("Agent {id}"),
            email: format!("{id}@example.com"),
            status: "online".to_string(),
            max_concurrent: max,
            current_load: load,
            department: None,
            skills: Vec::new(),
        }
    }

    #[test]
    fn least_loaded_wins() {
        let candidates = vec![
            agent("a", AgentSourceKind::Local, 3, 5),
            agent("b", AgentSourceKind::Local, 1, 5),
        ];
        let selected = select_agent(&candidates, &SelectionCriteria::default(), false).unwrap();
        assert_eq!(selected.id, "b");
    }

    #[test]
    fn skills_and_department_boost() {
        let mut specialist = agent("spec", AgentSourceKind::Local, 4, 5);
        specialist.skills = vec!["billing".to_string(), "refunds".to_string()];
        specialist.department = Some("finance".to_string());
        let generalist = agent("gen", AgentSourceKind::Local, 0, 5);

        let criteria = SelectionCriteria {
            department: Some("Finance".to_string()),
            required_skills: vec!["Billing".to_string()],
        };

        // 20 (skill) + 30 (department) outweigh the load difference.
        let selected = select_agent(&[specialist, generalist], &criteria, false).unwrap();
        assert_eq!(selected.id, "spec");
    }

    #[test]
    fn local_preference_breaks_source_ties() {
        let local = agent("loc", AgentSourceKind::Local, 2, 4);
        let external = agent("ext", AgentSourceKind::External, 2, 4);

        let selected = select_agent(
            &[external.clone(), local.clone()],
            &SelectionCriteria::default(),
            true,
        )
        .unwrap();
        assert_eq!(selected.id, "loc");

        // Without the preference the tie breaks deterministically by id.
        let selected =
            select_agent(&[external, local], &SelectionCriteria::default(), false).unwrap();
        assert_eq!(selected.id, "ext");
    }

    #[test]
    fn full_agents_are_excluded() {
        let full = agent("full", AgentSourceKind::Local, 5, 5);
        assert!(select_agent(&[full], &SelectionCriteria::default(), true).is_none());
    }

    #[test]
    fn offline_agents_are_excluded() {
        let mut away = agent("away", AgentSourceKind::Local, 0, 5);
        away.status = "away".to_string();
        assert!(select_agent(&[away], &SelectionCriteria::default(), true).is_none());
    }

    #[test]
    fn normalize_applies_field_mappings() {
        let mut config = ExternalAgentConfig::default();
        config.fields.id = "agent_key".to_string();
        config.fields.email = "mail".to_string();
        config.fields.skills = "tags".to_string();
        let source = ExternalAgentSource::new(config);

        let row = serde_json::json!({
            "agent_key": 42,
            "mail": "pat@crm.example",
            "name": "Pat",
            "status": "ONLINE",
            "max_concurrent": "3",
            "current_load": 1,
            "tags": "billing, refunds",
        });

        let agent = source.normalize(&row).unwrap();
        assert_eq!(agent.id, "42");
        assert_eq!(agent.email, "pat@crm.example");
        assert_eq!(agent.status, "online");
        assert_eq!(agent.max_concurrent, 3);
        assert_eq!(agent.skills, vec!["billing", "refunds"]);
        assert!(agent.is_available());
    }

    #[test]
    fn normalize_rejects_rows_without_identity() {
        let source = ExternalAgentSource::new(ExternalAgentConfig::default());
        let row = serde_json::json!({"name": "No Email"});
        assert!(source.normalize(&row).is_none());
    }
}
