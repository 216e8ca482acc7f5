/// In-process evaluation of filters, projections and pipeline stages over JSON documents.

use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

use super::query::{Accumulator, Condition, Direction, Expr, Filter, Group, GroupKey, Projection, Sort, Stage, SEARCH_SCORE};

/// Score contributed by each distinct query term found in a document.
pub const LEXICAL_TERM_WEIGHT: f64 = 10.0;

/// Look up a (possibly dotted) field.
pub fn get_field<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |v, key| v.as_object()?.get(key))
}

pub fn matches(doc: &Value, filter: &Filter) -> bool {
    match filter {
        Filter::All => true,
        Filter::Field(name, condition) => condition_matches(get_field(doc, name), condition),
        Filter::Or(parts) => parts.iter().any(|f| matches(doc, f)),
        Filter::And(parts) => parts.iter().all(|f| matches(doc, f)),
    }
}

fn condition_matches(value: Option<&Value>, condition: &Condition) -> bool {
    match condition {
        Condition::Eq(expected) => equals(value, expected),
        Condition::Ne(expected) => !equals(value, expected),
        Condition::In(candidates) => candidates.iter().any(|c| equals(value, c)),
        Condition::Gte(bound) => any_element(value, |v| {
            matches!(compare_values(v, bound), Some(Ordering::Greater | Ordering::Equal))
        }),
        Condition::Lte(bound) => any_element(value, |v| {
            matches!(compare_values(v, bound), Some(Ordering::Less | Ordering::Equal))
        }),
        Condition::Exists(present) => value.is_some() == *present,
    }
}

fn equals(value: Option<&Value>, expected: &Value) -> bool {
    match value {
        None => expected.is_null(),
        Some(v) if scalar_eq(v, expected) => true,
        Some(Value::Array(items)) => items.iter().any(|item| scalar_eq(item, expected)),
        Some(_) => false,
    }
}

fn scalar_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn any_element(value: Option<&Value>, pred: impl Fn(&Value) -> bool) -> bool {
    match value {
        None => false,
        Some(Value::Array(items)) => items.iter().any(&pred),
        Some(v) => pred(v),
    }
}

/// Ordering between two values of the same kind; `None` across kinds.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

/// Total order used for sorting: missing < null < numbers < strings < objects < arrays < bools.
fn sort_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => compare_values(x, y)
            .unwrap_or_else(|| type_rank(a).cmp(&type_rank(b))),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

pub fn sort_docs(docs: &mut [Value], sort: &Sort) {
    docs.sort_by(|a, b| {
        for (field, direction) in &sort.0 {
            let ord = sort_order(get_field(a, field), get_field(b, field));
            let ord = match direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

pub fn project(doc: Value, projection: &Projection) -> Value {
    let Value::Object(mut map) = doc else {
        return doc;
    };
    match projection {
        Projection::Include(fields) => {
            map.retain(|k, _| fields.iter().any(|f| f == k));
            Value::Object(map)
        }
        Projection::Exclude(fields) => {
            map.retain(|k, _| !fields.iter().any(|f| f == k));
            Value::Object(map)
        }
        Projection::Compute(exprs) => {
            let source = Value::Object(map);
            let out: Map<String, Value> = exprs
                .iter()
                .map(|(name, expr)| (name.clone(), eval_expr(&source, expr)))
                .collect();
            Value::Object(out)
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn of(value: &Value) -> Option<Num> {
        let Value::Number(n) = value else {
            return None;
        };
        match n.as_i64() {
            Some(i) => Some(Num::Int(i)),
            None => n.as_f64().map(Num::Float),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    fn add(self, other: Num) -> Num {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => a.checked_add(b).map(Num::Int)
                .unwrap_or(Num::Float(a as f64 + b as f64)),
            (a, b) => Num::Float(a.as_f64() + b.as_f64()),
        }
    }

    fn mul(self, other: Num) -> Num {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => a.checked_mul(b).map(Num::Int)
                .unwrap_or(Num::Float(a as f64 * b as f64)),
            (a, b) => Num::Float(a.as_f64() * b.as_f64()),
        }
    }

    fn into_value(self) -> Value {
        match self {
            Num::Int(i) => Value::from(i),
            Num::Float(f) => Value::from(f),
        }
    }
}

/// Numeric operands that are missing or non-numeric count as zero.
fn eval_num(doc: &Value, expr: &Expr) -> Num {
    match expr {
        Expr::Field(name) => get_field(doc, name).and_then(Num::of).unwrap_or(Num::Int(0)),
        Expr::Const(v) => Num::of(v).unwrap_or(Num::Int(0)),
        Expr::Add(parts) => parts.iter().fold(Num::Int(0), |acc, e| acc.add(eval_num(doc, e))),
        Expr::Multiply(parts) => parts.iter().fold(Num::Int(1), |acc, e| acc.mul(eval_num(doc, e))),
    }
}

fn eval_expr(doc: &Value, expr: &Expr) -> Value {
    match expr {
        Expr::Field(name) => get_field(doc, name).cloned().unwrap_or(Value::Null),
        Expr::Const(v) => v.clone(),
        Expr::Add(_) | Expr::Multiply(_) => eval_num(doc, expr).into_value(),
    }
}

/// Cosine similarity; `None` for mismatched dimensions or zero vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return None;
    }
    Some(dot / (na.sqrt() * nb.sqrt()))
}

fn vector_of(value: &Value) -> Option<Vec<f32>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

/// Lowercased, de-duplicated alphanumeric words of a query string.
pub fn search_terms(terms: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for word in terms.split(|c: char| !c.is_alphanumeric()) {
        let word = word.to_lowercase();
        if !word.is_empty() && !out.contains(&word) {
            out.push(word);
        }
    }
    out
}

fn collect_words(value: &Value, words: &mut Vec<String>) {
    match value {
        Value::String(s) => words.extend(search_terms(s)),
        Value::Array(items) => items.iter().for_each(|v| collect_words(v, words)),
        _ => {}
    }
}

/// `LEXICAL_TERM_WEIGHT` per distinct query term present in any of `fields`.
pub fn lexical_score(doc: &Value, fields: &[String], terms: &[String]) -> f64 {
    let mut words = Vec::new();
    for field in fields {
        if let Some(v) = get_field(doc, field) {
            collect_words(v, &mut words);
        }
    }
    let hits = terms.iter().filter(|t| words.contains(t)).count();
    hits as f64 * LEXICAL_TERM_WEIGHT
}

fn with_score(mut doc: Value, score: f64) -> Value {
    if let Value::Object(map) = &mut doc {
        map.insert(SEARCH_SCORE.to_string(), Value::from(score));
    }
    doc
}

fn by_score_desc(docs: &mut [Value]) {
    sort_docs(docs, &Sort::desc(SEARCH_SCORE));
}

fn group(docs: Vec<Value>, spec: &Group) -> Vec<Value> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();

    for doc in docs {
        let key = match &spec.key {
            GroupKey::Null => Value::Null,
            GroupKey::Field(f) => get_field(&doc, f).cloned().unwrap_or(Value::Null),
            GroupKey::Fields(fs) => Value::Object(
                fs.iter()
                    .map(|f| (f.clone(), get_field(&doc, f).cloned().unwrap_or(Value::Null)))
                    .collect(),
            ),
        };
        let slot = key.to_string();
        match index.get(&slot) {
            Some(&i) => groups[i].1.push(doc),
            None => {
                index.insert(slot, groups.len());
                groups.push((key, vec![doc]));
            }
        }
    }

    groups
        .into_iter()
        .map(|(key, members)| {
            let mut out = Map::new();
            out.insert("_id".to_string(), key);
            for (name, acc) in &spec.fields {
                let value = match acc {
                    Accumulator::First(f) => members
                        .first()
                        .and_then(|d| get_field(d, f).cloned())
                        .unwrap_or(Value::Null),
                    Accumulator::Sum(expr) => members
                        .iter()
                        .fold(Num::Int(0), |acc, d| acc.add(eval_num(d, expr)))
                        .into_value(),
                    Accumulator::Max(f) => members
                        .iter()
                        .filter_map(|d| get_field(d, f))
                        .max_by(|a, b| sort_order(Some(*a), Some(*b)))
                        .cloned()
                        .unwrap_or(Value::Null),
                };
                out.insert(name.clone(), value);
            }
            Value::Object(out)
        })
        .collect()
}

fn unwind(docs: Vec<Value>, field: &str) -> Vec<Value> {
    let mut out = Vec::new();
    for doc in docs {
        match get_field(&doc, field) {
            Some(Value::Array(items)) => {
                for item in items.clone() {
                    let mut copy = doc.clone();
                    if let Value::Object(map) = &mut copy {
                        map.insert(field.to_string(), item);
                    }
                    out.push(copy);
                }
            }
            Some(Value::Null) | None => {}
            Some(_) => out.push(doc),
        }
    }
    out
}

/// Run one stage over a document set.
pub fn apply_stage(stage: &Stage, docs: Vec<Value>) -> Vec<Value> {
    match stage {
        Stage::Match(filter) => docs.into_iter().filter(|d| matches(d, filter)).collect(),
        Stage::VectorSearch { vector, field, k, filter } => {
            let mut scored: Vec<Value> = docs
                .into_iter()
                .filter(|d| matches(d, filter))
                .filter_map(|d| {
                    let score = cosine(vector, &vector_of(get_field(&d, field)?)?)?;
                    Some(with_score(d, score))
                })
                .collect();
            by_score_desc(&mut scored);
            scored.truncate(*k);
            scored
        }
        Stage::TextSearch { terms, fields, filter } => {
            let terms = search_terms(terms);
            let mut scored: Vec<Value> = docs
                .into_iter()
                .filter(|d| matches(d, filter))
                .filter_map(|d| {
                    let score = lexical_score(&d, fields, &terms);
                    (score > 0.0).then(|| with_score(d, score))
                })
                .collect();
            by_score_desc(&mut scored);
            scored
        }
        Stage::Sort(sort) => {
            let mut docs = docs;
            sort_docs(&mut docs, sort);
            docs
        }
        Stage::Limit(n) => docs.into_iter().take(*n).collect(),
        Stage::Unwind(field) => unwind(docs, field),
        Stage::Group(spec) => group(docs, spec),
        Stage::Project(projection) => docs.into_iter().map(|d| project(d, projection)).collect(),
    }
}

pub fn execute(stages: &[Stage], docs: Vec<Value>) -> Vec<Value> {
    stages.iter().fold(docs, |docs, stage| apply_stage(stage, docs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::query::Pipeline;
    use serde_json::json;

    #[test]
    fn test_array_fields_match_on_any_element() {
        let doc = json!({"mapped_urls": ["a", "b"], "kind": "post"});
        assert!(matches(&doc, &Filter::eq("mapped_urls", "b")));
        assert!(matches(&doc, &Filter::is_in("mapped_urls", ["x", "a"])));
        assert!(!matches(&doc, &Filter::is_in("mapped_urls", ["x", "y"])));
    }

    #[test]
    fn test_ne_and_exists_match_missing_fields() {
        let doc = json!({"url": "u1"});
        assert!(matches(&doc, &Filter::ne("kind", "channel")));
        assert!(matches(&doc, &Filter::exists("summary", false)));
        assert!(!matches(&doc, &Filter::exists("summary", true)));
        assert!(!matches(&doc, &Filter::gte("updated", 10)));
    }

    #[test]
    fn test_numeric_comparisons_ignore_int_float_split() {
        let doc = json!({"updated": 100, "search_score": 0.75});
        assert!(matches(&doc, &Filter::gte("updated", 100.0)));
        assert!(matches(&doc, &Filter::lte("updated", 100)));
        assert!(matches(&doc, &Filter::gte("search_score", 0.73)));
        assert!(!matches(&doc, &Filter::gte("search_score", 0.8)));
    }

    #[test]
    fn test_sort_desc_puts_missing_last() {
        let mut docs = vec![json!({"id": 1}), json!({"id": 2, "updated": 5}), json!({"id": 3, "updated": 9})];
        sort_docs(&mut docs, &Sort::desc("updated"));
        let ids: Vec<i64> = docs.iter().map(|d| d["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn test_vector_stage_scores_filters_and_limits() {
        let docs = vec![
            json!({"url": "same", "v": [1.0, 0.0]}),
            json!({"url": "close", "v": [1.0, 0.2]}),
            json!({"url": "far", "v": [0.0, 1.0]}),
            json!({"url": "channel", "v": [1.0, 0.0], "kind": "channel"}),
            json!({"url": "none"}),
        ];
        let pipeline = Pipeline::vector_search(vec![1.0, 0.0], "v").apply_all(&[
            crate::store::query::with_filter(Filter::ne("kind", "channel")),
            crate::store::query::with_top_n(2),
        ]);
        let out = execute(&pipeline.stages, docs);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["url"], "same");
        assert_eq!(out[1]["url"], "close");
        assert!((out[0][SEARCH_SCORE].as_f64().unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_text_stage_scores_distinct_terms() {
        let fields = vec!["keyphrase".to_string(), "event".to_string()];
        let doc = json!({"keyphrase": "OpenAI", "event": "OpenAI releases a new model"});
        let terms = search_terms("openai model openai");
        assert_eq!(terms, vec!["openai", "model"]);
        assert_eq!(lexical_score(&doc, &fields, &terms), 20.0);
    }

    #[test]
    fn test_noise_style_group_and_compute() {
        let docs = vec![
            json!({"mapped_url": "u1", "source": "reddit", "channel": "r/a", "updated": 2, "likes": 10, "comments": 1}),
            json!({"mapped_url": "u1", "source": "reddit", "channel": "r/a", "updated": 1, "likes": 99, "comments": 99}),
            json!({"mapped_url": "u1", "source": "ycombinator", "channel": "", "updated": 1, "likes": 5, "comments": 2}),
        ];
        let stages = vec![
            Stage::Sort(Sort::desc("updated")),
            Stage::Group(
                Group::by(GroupKey::Fields(vec!["mapped_url".into(), "source".into(), "channel".into()]))
                    .with("mapped_url", Accumulator::First("mapped_url".into()))
                    .with("likes", Accumulator::First("likes".into()))
                    .with("comments", Accumulator::First("comments".into())),
            ),
            Stage::Group(
                Group::by(GroupKey::Field("mapped_url".into()))
                    .with("likes", Accumulator::Sum(Expr::field("likes")))
                    .with("comments", Accumulator::Sum(Expr::field("comments"))),
            ),
            Stage::Project(Projection::Compute(vec![
                ("mapped_url".into(), Expr::field("_id")),
                (
                    "score".into(),
                    Expr::Add(vec![
                        Expr::Multiply(vec![Expr::Const(json!(3)), Expr::field("comments")]),
                        Expr::field("likes"),
                    ]),
                ),
            ])),
        ];
        let out = execute(&stages, docs);
        assert_eq!(out.len(), 1);
        // latest reddit record (10 likes, 1 comment) + ycombinator (5 likes, 2 comments)
        assert_eq!(out[0]["score"], json!(3 * 3 + 15));
        assert_eq!(out[0]["mapped_url"], "u1");
    }

    #[test]
    fn test_unwind_and_group_max() {
        let docs = vec![
            json!({"match_count": 12, "mapped_urls": ["a", "b"]}),
            json!({"match_count": 30, "mapped_urls": ["b"]}),
            json!({"match_count": 7, "mapped_urls": []}),
        ];
        let stages = vec![
            Stage::Unwind("mapped_urls".into()),
            Stage::Group(Group::by(GroupKey::Field("mapped_urls".into()))
                .with("match_count", Accumulator::Max("match_count".into()))),
            Stage::Sort(Sort::asc("_id")),
        ];
        let out = execute(&stages, docs);
        assert_eq!(out, vec![json!({"_id": "a", "match_count": 12}), json!({"_id": "b", "match_count": 30})]);
    }

    #[test]
    fn test_projection_include_and_exclude() {
        let doc = json!({"url": "u", "text": "long", "embeddings": [1.0]});
        assert_eq!(project(doc.clone(), &Projection::include(&["url"])), json!({"url": "u"}));
        assert_eq!(
            project(doc, &Projection::exclude(&["embeddings"])),
            json!({"url": "u", "text": "long"})
        );
    }
}
