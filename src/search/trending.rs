/// Trend-ranked beans and nuggets
///
/// A nugget's `match_count` is its trend score. Beans inherit the best score of
/// the nuggets mapping to them; nuggets trend when they map to beans that match
/// the query.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

use super::retrieval::{logged, union_urls};
use super::SearchOptions;
use crate::sack::models::{Bean, BeanNugget};
use crate::sack::BeanSack;
use crate::store::query::{Accumulator, Condition, Filter, Group, GroupKey, Pipeline, Projection, Sort, Stage};

#[derive(Debug, Deserialize)]
struct UrlTrend {
    #[serde(rename = "_id")]
    url: String,
    #[serde(default)]
    match_count: i64,
}

impl BeanSack {
    /// Nuggets in the window that map to beans matching the query, highest score first.
    pub async fn trending_nuggets(&self, opts: &SearchOptions) -> Vec<BeanNugget> {
        let window = opts.condition("updated");

        let scored = logged(
            "trending_nuggets",
            self.nuggets
                .get(
                    &Filter::gte("match_count", 1).and(window.clone()),
                    Some(&Projection::include(&["mapped_urls"])),
                    None,
                    0,
                )
                .await,
        );
        let initial_urls = union_urls(&scored);
        if initial_urls.is_empty() {
            return Vec::new();
        }

        // mapped beans count whatever their own age or kind; only the search inputs narrow them
        let candidates = SearchOptions {
            scalar_filter: BTreeMap::from([(
                "url".to_string(),
                Condition::In(initial_urls.iter().map(|u| u.as_str().into()).collect()),
            )]),
            top_n: initial_urls.len(),
            ..opts.clone()
        };
        let matched: Vec<String> = self.fuzzy_candidates(&candidates).await.into_iter().map(|b| b.url).collect();
        if matched.is_empty() {
            return Vec::new();
        }

        let result = self
            .nuggets
            .get(
                &window.and(Filter::is_in("mapped_urls", matched)),
                Some(&Projection::exclude(&["embeddings"])),
                Some(&Sort::desc("match_count")),
                opts.top_n as i64,
            )
            .await;
        logged("trending_nuggets", result)
    }

    /// Fuzzy-search candidates re-ranked by the best trend score of their nuggets.
    /// Beans no nugget maps to stay in the result with a score of 0.
    pub async fn trending_beans(&self, opts: &SearchOptions) -> Vec<Bean> {
        let mut beans = self.fuzzy_candidates(opts).await;
        if beans.is_empty() {
            return beans;
        }

        let urls: Vec<&str> = beans.iter().map(|b| b.url.as_str()).collect();
        let pipeline = Pipeline::new()
            .stage(Stage::Match(Filter::is_in("mapped_urls", urls.iter().copied())))
            .stage(Stage::Unwind("mapped_urls".to_string()))
            .stage(Stage::Match(Filter::is_in("mapped_urls", urls.iter().copied())))
            .stage(Stage::Group(
                Group::by(GroupKey::Field("mapped_urls".to_string()))
                    .with("match_count", Accumulator::Max("match_count".to_string())),
            ));
        let trends: HashMap<String, i64> = logged("trending_beans", self.nuggets.aggregate::<UrlTrend>(&pipeline).await)
            .into_iter()
            .map(|t| (t.url, t.match_count))
            .collect();

        for bean in &mut beans {
            bean.search_score = Some(trends.get(&bean.url).copied().unwrap_or(0) as f64);
        }
        beans.sort_by(|a, b| b.search_score.unwrap_or(0.0).total_cmp(&a.search_score.unwrap_or(0.0)));
        beans.truncate(opts.top_n);
        self.attach_noise(beans).await
    }
}
