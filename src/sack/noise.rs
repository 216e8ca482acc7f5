/// Media noise scoring and attachment

use serde_json::json;

use super::models::{Bean, MediaNoise};
use super::BeanSack;
use crate::store::query::{Accumulator, Expr, Filter, Group, GroupKey, Pipeline, Projection, Sort, Stage};

impl BeanSack {
    /// Aggregate engagement for `urls`.
    ///
    /// Only the most recent record per (mapped_url, source, channel) counts. Returns
    /// one record per url with summed likes and comments and
    /// `score = likes + 3 * comments`, or a single record over all urls when
    /// `total` is set. Failures yield no records.
    pub async fn media_noise_score(&self, urls: &[String], total: bool) -> Vec<MediaNoise> {
        if urls.is_empty() {
            return Vec::new();
        }

        let (key, mut fields) = if total {
            (GroupKey::Null, Vec::new())
        } else {
            (GroupKey::Field("mapped_url".to_string()), vec![("mapped_url".to_string(), Expr::field("_id"))])
        };
        fields.extend([
            ("likes".to_string(), Expr::field("likes")),
            ("comments".to_string(), Expr::field("comments")),
            (
                "score".to_string(),
                Expr::Add(vec![
                    Expr::field("likes"),
                    Expr::Multiply(vec![Expr::Const(json!(3)), Expr::field("comments")]),
                ]),
            ),
        ]);

        let pipeline = Pipeline::new()
            .stage(Stage::Match(Filter::is_in("mapped_url", urls.iter().map(String::as_str))))
            .stage(Stage::Sort(Sort::desc("updated")))
            .stage(Stage::Group(
                Group::by(GroupKey::Fields(vec!["mapped_url".into(), "source".into(), "channel".into()]))
                    .with("mapped_url", Accumulator::First("mapped_url".into()))
                    .with("likes", Accumulator::First("likes".into()))
                    .with("comments", Accumulator::First("comments".into())),
            ))
            .stage(Stage::Group(
                Group::by(key)
                    .with("likes", Accumulator::Sum(Expr::field("likes")))
                    .with("comments", Accumulator::Sum(Expr::field("comments"))),
            ))
            .stage(Stage::Project(Projection::Compute(fields)));

        self.noises.aggregate(&pipeline).await.unwrap_or_else(|e| {
            tracing::warn!(urls = urls.len(), error = %e, "Media noise aggregation failed");
            Vec::new()
        })
    }

    /// Attach the aggregated noise of each bean's url to the bean.
    pub async fn attach_noise(&self, mut beans: Vec<Bean>) -> Vec<Bean> {
        let urls: Vec<String> = beans.iter().map(|b| b.url.clone()).collect();
        let noises = self.media_noise_score(&urls, false).await;
        for bean in &mut beans {
            bean.media_noise = noises.iter().find(|n| n.mapped_url == bean.url).cloned();
        }
        beans
    }
}
