/// PostgreSQL-backed document storage
///
/// Each collection is a table of JSONB documents. Filters compile to JSONB
/// predicates with bound parameters; vector search uses pgvector cosine distance
/// over the embedding array cast to `vector`; lexical search uses the English
/// text-search configuration. Pipeline stages after the first run in process.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    types::Json,
    Postgres, QueryBuilder,
};
use std::time::Duration;

use super::eval::{self, LEXICAL_TERM_WEIGHT};
use super::query::{Condition, Direction, Filter, Pipeline, Projection, Sort, Stage, SEARCH_SCORE};
use super::{Backend, Collection};
use crate::errors::SackError;

pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    /// Connect to the database at `database_url`.
    ///
    /// If run_migrations is true, pending migrations (tables, unique url index,
    /// pgvector extension) are applied on startup.
    pub async fn new(database_url: &str, run_migrations: bool) -> Result<Self, SackError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .idle_timeout(Duration::from_secs(300))
            .max_lifetime(Duration::from_secs(1800))
            .connect(database_url)
            .await
            .map_err(|e| SackError::Storage(format!("Failed to connect to database: {}", e)))?;

        if run_migrations {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(|e| SackError::Storage(format!("Migration failed: {}", e)))?;
        }

        Ok(PgBackend { pool })
    }
}

fn field_path(name: &str) -> Vec<String> {
    name.split('.').map(str::to_string).collect()
}

fn push_field(qb: &mut QueryBuilder<'_, Postgres>, name: &str) {
    qb.push("(doc #> ");
    qb.push_bind(field_path(name));
    qb.push("::text[])");
}

pub(crate) fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) {
    match filter {
        Filter::All => {
            qb.push("TRUE");
        }
        Filter::Field(name, condition) => push_condition(qb, name, condition),
        Filter::Or(parts) | Filter::And(parts) if parts.is_empty() => {
            qb.push(if matches!(filter, Filter::Or(_)) { "FALSE" } else { "TRUE" });
        }
        Filter::Or(parts) | Filter::And(parts) => {
            let joiner = if matches!(filter, Filter::Or(_)) { " OR " } else { " AND " };
            qb.push("(");
            for (i, part) in parts.iter().enumerate() {
                if i > 0 {
                    qb.push(joiner);
                }
                push_filter(qb, part);
            }
            qb.push(")");
        }
    }
}

fn push_condition(qb: &mut QueryBuilder<'_, Postgres>, name: &str, condition: &Condition) {
    match condition {
        Condition::Eq(Value::Null) => {
            qb.push("(");
            push_field(qb, name);
            qb.push(" IS NULL OR ");
            push_field(qb, name);
            qb.push(" = 'null'::jsonb)");
        }
        Condition::Eq(value) => {
            // jsonb containment also matches an element of an array field
            qb.push("COALESCE(");
            push_field(qb, name);
            qb.push(" @> ");
            qb.push_bind(Json(value.clone()));
            qb.push("::jsonb, FALSE)");
        }
        Condition::Ne(value) => {
            qb.push("NOT ");
            push_condition(qb, name, &Condition::Eq(value.clone()));
        }
        Condition::In(values) => {
            qb.push("EXISTS (SELECT 1 FROM jsonb_array_elements(");
            qb.push_bind(Json(Value::Array(values.clone())));
            qb.push("::jsonb) AS candidate(v) WHERE ");
            push_field(qb, name);
            qb.push(" @> candidate.v)");
        }
        Condition::Gte(value) | Condition::Lte(value) => {
            let op = if matches!(condition, Condition::Gte(_)) { " >= " } else { " <= " };
            qb.push("(jsonb_typeof(");
            push_field(qb, name);
            qb.push(") = jsonb_typeof(");
            qb.push_bind(Json(value.clone()));
            qb.push("::jsonb) AND ");
            push_field(qb, name);
            qb.push(op);
            qb.push_bind(Json(value.clone()));
            qb.push("::jsonb)");
        }
        Condition::Exists(present) => {
            push_field(qb, name);
            qb.push(if *present { " IS NOT NULL" } else { " IS NULL" });
        }
    }
}

fn push_sort(qb: &mut QueryBuilder<'_, Postgres>, sort: &Sort) {
    if sort.0.is_empty() {
        return;
    }
    qb.push(" ORDER BY ");
    for (i, (field, direction)) in sort.0.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        push_field(qb, field);
        qb.push(match direction {
            Direction::Asc => " ASC NULLS FIRST",
            Direction::Desc => " DESC NULLS LAST",
        });
    }
}

/// Select expression for a projection that SQL can do itself.
fn push_projected_doc(qb: &mut QueryBuilder<'_, Postgres>, projection: Option<&Projection>) {
    match projection {
        Some(Projection::Include(fields)) => {
            qb.push("COALESCE((SELECT jsonb_object_agg(key, value) FROM jsonb_each(doc) WHERE key = ANY(");
            qb.push_bind(fields.clone());
            qb.push("::text[])), '{}'::jsonb)");
        }
        Some(Projection::Exclude(fields)) => {
            qb.push("(doc - ");
            qb.push_bind(fields.clone());
            qb.push("::text[])");
        }
        _ => {
            qb.push("doc");
        }
    }
}

/// Concatenation of a collection's text fields for `to_tsvector`.
fn text_document(collection: &Collection) -> String {
    let parts: Vec<String> = collection
        .text_fields
        .iter()
        .map(|f| format!("doc->>'{}'", f.replace('\'', "''")))
        .collect();
    if parts.is_empty() {
        "''".to_string()
    } else {
        format!("concat_ws(' ', {})", parts.join(", "))
    }
}

impl PgBackend {
    async fn fetch_docs(&self, mut qb: QueryBuilder<'_, Postgres>) -> Result<Vec<Value>, SackError> {
        let rows: Vec<Json<Value>> = qb
            .build_query_scalar::<Json<Value>>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|Json(v)| v).collect())
    }

    /// Run the head stage in SQL. Returns how many stages were consumed.
    async fn run_head(&self, collection: &Collection, stages: &[Stage]) -> Result<(Vec<Value>, usize), SackError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT ");
        let consumed = match stages.first() {
            Some(Stage::Match(filter)) => {
                qb.push("doc FROM ");
                qb.push(collection.name);
                qb.push(" WHERE ");
                push_filter(&mut qb, filter);
                1
            }
            Some(Stage::VectorSearch { vector, field, k, filter }) => {
                let query = pgvector::Vector::from(vector.clone());
                qb.push("doc || jsonb_build_object('");
                qb.push(SEARCH_SCORE);
                qb.push("', 1 - (");
                push_field(&mut qb, field);
                qb.push("::text::vector <=> ");
                qb.push_bind(query.clone());
                qb.push(")) FROM ");
                qb.push(collection.name);
                qb.push(" WHERE ");
                push_filter(&mut qb, filter);
                // Only rows whose array has the query's dimension can be cast and compared
                qb.push(" AND (CASE WHEN jsonb_typeof(");
                push_field(&mut qb, field);
                qb.push(") = 'array' THEN jsonb_array_length(");
                push_field(&mut qb, field);
                qb.push(") ELSE 0 END) = ");
                qb.push_bind(vector.len() as i32);
                qb.push(" ORDER BY ");
                push_field(&mut qb, field);
                qb.push("::text::vector <=> ");
                qb.push_bind(query);
                qb.push(" LIMIT ");
                qb.push_bind(*k as i64);
                1
            }
            Some(Stage::TextSearch { terms, filter, .. }) => {
                let words = eval::search_terms(terms);
                if words.is_empty() {
                    return Ok((Vec::new(), 1));
                }
                let document = format!("to_tsvector('english', {})", text_document(collection));
                qb.push("scored FROM (SELECT doc || jsonb_build_object('");
                qb.push(SEARCH_SCORE);
                qb.push("', (SELECT count(*) FROM unnest(");
                qb.push_bind(words.clone());
                qb.push("::text[]) AS t(term) WHERE ");
                qb.push(&document);
                qb.push(" @@ plainto_tsquery('english', t.term)) * ");
                qb.push(LEXICAL_TERM_WEIGHT.to_string());
                qb.push(") AS scored FROM ");
                qb.push(collection.name);
                qb.push(" WHERE ");
                push_filter(&mut qb, filter);
                qb.push(" AND ");
                qb.push(&document);
                qb.push(" @@ to_tsquery('english', ");
                qb.push_bind(words.join(" | "));
                qb.push(")) AS hits ORDER BY (scored->'");
                qb.push(SEARCH_SCORE);
                qb.push("') DESC");
                1
            }
            _ => {
                qb.push("doc FROM ");
                qb.push(collection.name);
                0
            }
        };
        let docs = self.fetch_docs(qb).await?;
        Ok((docs, consumed))
    }
}

#[async_trait]
impl Backend for PgBackend {
    async fn insert(&self, collection: &Collection, docs: Vec<Value>) -> Result<Vec<Value>, SackError> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Postgres>::new("INSERT INTO ");
        qb.push(collection.name);
        qb.push(" (doc) SELECT value FROM jsonb_array_elements(");
        qb.push_bind(Json(Value::Array(docs)));
        qb.push("::jsonb) ON CONFLICT DO NOTHING RETURNING doc");
        self.fetch_docs(qb).await
    }

    async fn update_batch(&self, collection: &Collection, batch: Vec<(Filter, Value)>) -> Result<u64, SackError> {
        let mut tx = self.pool.begin().await?;
        let mut changed = 0;
        for (filter, set) in batch {
            let mut qb = QueryBuilder::<Postgres>::new("UPDATE ");
            qb.push(collection.name);
            qb.push(" SET doc = doc || ");
            qb.push_bind(Json(set));
            qb.push("::jsonb WHERE id = (SELECT id FROM ");
            qb.push(collection.name);
            qb.push(" WHERE ");
            push_filter(&mut qb, &filter);
            qb.push(" LIMIT 1)");
            changed += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(changed)
    }

    async fn find(
        &self,
        collection: &Collection,
        filter: &Filter,
        projection: Option<&Projection>,
        sort: Option<&Sort>,
        limit: Option<usize>,
    ) -> Result<Vec<Value>, SackError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT ");
        push_projected_doc(&mut qb, projection);
        qb.push(" FROM ");
        qb.push(collection.name);
        qb.push(" WHERE ");
        push_filter(&mut qb, filter);
        if let Some(sort) = sort {
            push_sort(&mut qb, sort);
        }
        if let Some(limit) = limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit as i64);
        }
        let docs = self.fetch_docs(qb).await?;
        Ok(match projection {
            Some(p @ Projection::Compute(_)) => docs.into_iter().map(|d| eval::project(d, p)).collect(),
            _ => docs,
        })
    }

    async fn aggregate(&self, collection: &Collection, pipeline: &Pipeline) -> Result<Vec<Value>, SackError> {
        let (docs, consumed) = self.run_head(collection, &pipeline.stages).await?;
        Ok(eval::execute(&pipeline.stages[consumed..], docs))
    }

    async fn delete(&self, collection: &Collection, filter: &Filter) -> Result<u64, SackError> {
        let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM ");
        qb.push(collection.name);
        qb.push(" WHERE ");
        push_filter(&mut qb, filter);
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }
}
