/// Backend-neutral query vocabulary
///
/// Filters, projections, sorts and aggregation pipelines are plain values. The
/// Postgres backend compiles the leading stage to SQL and hands the rest to the
/// in-process evaluator in `eval`; the memory backend evaluates everything.

use serde_json::Value;

/// A single-field predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Equal, or any element equal when the field is an array
    Eq(Value),
    /// Not equal; matches documents missing the field
    Ne(Value),
    /// Equal to any of the values (array fields match on any element)
    In(Vec<Value>),
    Gte(Value),
    Lte(Value),
    Exists(bool),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Filter {
    #[default]
    All,
    Field(String, Condition),
    Or(Vec<Filter>),
    And(Vec<Filter>),
}

impl Filter {
    pub fn field(name: &str, condition: Condition) -> Self {
        Filter::Field(name.to_string(), condition)
    }

    pub fn eq(name: &str, value: impl Into<Value>) -> Self {
        Self::field(name, Condition::Eq(value.into()))
    }

    pub fn ne(name: &str, value: impl Into<Value>) -> Self {
        Self::field(name, Condition::Ne(value.into()))
    }

    pub fn is_in<V: Into<Value>>(name: &str, values: impl IntoIterator<Item = V>) -> Self {
        Self::field(name, Condition::In(values.into_iter().map(Into::into).collect()))
    }

    pub fn gte(name: &str, value: impl Into<Value>) -> Self {
        Self::field(name, Condition::Gte(value.into()))
    }

    pub fn lte(name: &str, value: impl Into<Value>) -> Self {
        Self::field(name, Condition::Lte(value.into()))
    }

    pub fn exists(name: &str, present: bool) -> Self {
        Self::field(name, Condition::Exists(present))
    }

    /// Conjunction that flattens nested `And`s and drops `All`.
    pub fn and(self, other: Filter) -> Filter {
        let mut parts = Vec::new();
        for f in [self, other] {
            match f {
                Filter::All => {}
                Filter::And(inner) => parts.extend(inner),
                f => parts.push(f),
            }
        }
        match parts.len() {
            0 => Filter::All,
            1 => parts.remove(0),
            _ => Filter::And(parts),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Filter::All)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Sort(pub Vec<(String, Direction)>);

impl Sort {
    pub fn asc(field: &str) -> Self {
        Sort(vec![(field.to_string(), Direction::Asc)])
    }

    pub fn desc(field: &str) -> Self {
        Sort(vec![(field.to_string(), Direction::Desc)])
    }
}

/// Computed value inside a projection or group.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Field(String),
    Const(Value),
    Add(Vec<Expr>),
    Multiply(Vec<Expr>),
}

impl Expr {
    pub fn field(name: &str) -> Self {
        Expr::Field(name.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// Keep only these fields
    Include(Vec<String>),
    /// Drop these fields
    Exclude(Vec<String>),
    /// Replace each document by these computed fields
    Compute(Vec<(String, Expr)>),
}

impl Projection {
    pub fn include(fields: &[&str]) -> Self {
        Projection::Include(fields.iter().map(|f| f.to_string()).collect())
    }

    pub fn exclude(fields: &[&str]) -> Self {
        Projection::Exclude(fields.iter().map(|f| f.to_string()).collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    First(String),
    Sum(Expr),
    Max(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupKey {
    /// Everything in one group
    Null,
    Field(String),
    /// Compound key rendered as an object
    Fields(Vec<String>),
}

/// Group stage. The key lands in `_id` of each output document.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub key: GroupKey,
    pub fields: Vec<(String, Accumulator)>,
}

impl Group {
    pub fn by(key: GroupKey) -> Self {
        Group { key, fields: Vec::new() }
    }

    pub fn with(mut self, name: &str, acc: Accumulator) -> Self {
        self.fields.push((name.to_string(), acc));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Filter),
    /// Cosine nearest neighbours on `field`, scored into `search_score`
    VectorSearch {
        vector: Vec<f32>,
        field: String,
        k: usize,
        filter: Filter,
    },
    /// Lexical match over `fields`, scored into `search_score` and sorted by it
    TextSearch {
        terms: String,
        fields: Vec<String>,
        filter: Filter,
    },
    Sort(Sort),
    Limit(usize),
    Unwind(String),
    Group(Group),
    Project(Projection),
}

/// Knobs applied to a search pipeline after its head stage is built.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchOption {
    Filter(Filter),
    TopN(usize),
    Projection(Projection),
    MinSearchScore(f64),
}

pub fn with_filter(filter: Filter) -> SearchOption {
    SearchOption::Filter(filter)
}

pub fn with_top_n(n: usize) -> SearchOption {
    SearchOption::TopN(n)
}

pub fn with_projection(projection: Projection) -> SearchOption {
    SearchOption::Projection(projection)
}

pub fn with_min_search_score(score: f64) -> SearchOption {
    SearchOption::MinSearchScore(score)
}

/// Field the search stages write their score into.
pub const SEARCH_SCORE: &str = "search_score";

/// Default neighbour count when no top-n option is given.
pub const DEFAULT_VECTOR_TOP_N: usize = 5;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline { stages: Vec::new() }
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn vector_search(vector: Vec<f32>, field: &str) -> Self {
        Pipeline::new().stage(Stage::VectorSearch {
            vector,
            field: field.to_string(),
            k: DEFAULT_VECTOR_TOP_N,
            filter: Filter::All,
        })
    }

    pub fn text_search(terms: String, fields: &[&str]) -> Self {
        Pipeline::new().stage(Stage::TextSearch {
            terms,
            fields: fields.iter().map(|f| f.to_string()).collect(),
            filter: Filter::All,
        })
    }

    /// Apply a search option. Filters and top-n fold into a vector head stage;
    /// on any other head they become match/limit stages.
    pub fn apply(mut self, option: SearchOption) -> Self {
        match option {
            SearchOption::Filter(f) => match self.stages.first_mut() {
                Some(Stage::VectorSearch { filter, .. }) | Some(Stage::TextSearch { filter, .. }) => {
                    *filter = std::mem::take(filter).and(f);
                }
                _ => self.stages.push(Stage::Match(f)),
            },
            SearchOption::TopN(n) => match self.stages.first_mut() {
                Some(Stage::VectorSearch { k, .. }) => *k = n,
                _ => self.stages.push(Stage::Limit(n)),
            },
            SearchOption::Projection(p) => self.stages.push(Stage::Project(p)),
            SearchOption::MinSearchScore(score) => {
                self.stages.push(Stage::Match(Filter::gte(SEARCH_SCORE, score)))
            }
        }
        self
    }

    pub fn apply_all(self, options: &[SearchOption]) -> Self {
        options.iter().cloned().fold(self, Pipeline::apply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_and_flattens_and_drops_all() {
        let f = Filter::All.and(Filter::eq("kind", "post"));
        assert_eq!(f, Filter::eq("kind", "post"));

        let f = Filter::eq("a", 1).and(Filter::eq("b", 2)).and(Filter::eq("c", 3));
        match f {
            Filter::And(parts) => assert_eq!(parts.len(), 3),
            other => panic!("expected And, got {:?}", other),
        }
    }

    #[test]
    fn test_vector_options_fold_into_head_stage() {
        let pipeline = Pipeline::vector_search(vec![1.0, 0.0], "category_embeddings").apply_all(&[
            with_filter(Filter::ne("kind", "channel")),
            with_top_n(100),
            with_min_search_score(0.73),
            with_projection(Projection::include(&["url"])),
        ]);

        assert_eq!(pipeline.stages.len(), 3);
        match &pipeline.stages[0] {
            Stage::VectorSearch { k, filter, field, .. } => {
                assert_eq!(*k, 100);
                assert_eq!(field, "category_embeddings");
                assert_eq!(*filter, Filter::ne("kind", "channel"));
            }
            other => panic!("unexpected head {:?}", other),
        }
        assert_eq!(pipeline.stages[1], Stage::Match(Filter::gte(SEARCH_SCORE, 0.73)));
    }

    #[test]
    fn test_text_options_append_limit() {
        let pipeline = Pipeline::text_search("ai chips".to_string(), &["keyphrase", "event"])
            .apply_all(&[with_min_search_score(10.0), with_top_n(2)]);

        assert_eq!(pipeline.stages.len(), 3);
        assert_eq!(pipeline.stages[2], Stage::Limit(2));
    }

    #[test]
    fn test_filter_builders() {
        assert_eq!(
            Filter::is_in("url", ["a", "b"]),
            Filter::Field("url".to_string(), Condition::In(vec![json!("a"), json!("b")]))
        );
        assert!(Filter::default().is_all());
    }
}
