//! # Paged (infinite) queries.
//!
//! An infinite query keeps `{pages, page_params}` as its payload and fetches
//! one page per attempt in a chosen direction, or replays every loaded page
//! sequentially on refetch. The machinery plugs into the regular fetch
//! pipeline through the [`QueryBehavior`] seam; queries themselves stay
//! unaware of paging.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;
use crate::key::hash_query_key;
use crate::options::{
    BehaviorContext, FetchDirection, QueryBehavior, QueryFnContext, QueryFunction,
};

/// Payload shape of an infinite query.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InfiniteData {
    /// Loaded pages, oldest first.
    pub pages: Vec<Value>,
    /// Page parameter used for each loaded page.
    pub page_params: Vec<Value>,
}

impl InfiniteData {
    /// Parses the payload of an infinite query; empty when absent/foreign.
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    /// Serializes back into a cacheable payload.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Computes the parameter for the page adjacent to `data`.
pub type PageParamFn = Arc<dyn Fn(&InfiniteData) -> Option<Value> + Send + Sync>;

/// Paging configuration.
#[derive(Clone)]
pub struct InfiniteOptions {
    /// Parameter for the very first page.
    pub initial_page_param: Value,
    /// Parameter for the page after the loaded ones (`None` = end).
    pub get_next_page_param: PageParamFn,
    /// Parameter for the page before the loaded ones.
    pub get_previous_page_param: Option<PageParamFn>,
    /// Keep at most this many pages (0 = unbounded). Fetching past the
    /// limit drops pages at the opposite end.
    pub max_pages: usize,
}

impl InfiniteOptions {
    /// Options with a next-page function only.
    pub fn new(
        initial_page_param: Value,
        get_next_page_param: impl Fn(&InfiniteData) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            initial_page_param,
            get_next_page_param: Arc::new(get_next_page_param),
            get_previous_page_param: None,
            max_pages: 0,
        }
    }

    pub fn with_previous_page_param(
        mut self,
        f: impl Fn(&InfiniteData) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        self.get_previous_page_param = Some(Arc::new(f));
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Whether a page after the loaded ones exists.
    pub fn has_next_page(&self, data: &InfiniteData) -> bool {
        !data.pages.is_empty() && (self.get_next_page_param)(data).is_some()
    }

    /// Whether a page before the loaded ones exists.
    pub fn has_previous_page(&self, data: &InfiniteData) -> bool {
        match &self.get_previous_page_param {
            Some(get_previous) => !data.pages.is_empty() && get_previous(data).is_some(),
            None => false,
        }
    }
}

/// Fetch-pipeline hook implementing paged fetches.
pub struct InfiniteQueryBehavior {
    options: InfiniteOptions,
    /// Page count to load on a full fetch; `None` replays the loaded pages.
    pages: Option<usize>,
}

impl InfiniteQueryBehavior {
    pub fn new(options: InfiniteOptions, pages: Option<usize>) -> Arc<Self> {
        Arc::new(Self { options, pages })
    }
}

impl QueryBehavior for InfiniteQueryBehavior {
    fn fetch(&self, ctx: BehaviorContext) -> BoxFuture<'static, Result<Value, anyhow::Error>> {
        let options = self.options.clone();
        let pages_target = self.pages;
        async move {
            let query_fn = match ctx.query_fn {
                QueryFunction::Fetch(f) => f,
                QueryFunction::Skip => {
                    return Err(anyhow::Error::new(EngineError::SkippedQueryFn {
                        query_hash: hash_query_key(&ctx.query_key),
                    }));
                }
            };
            let fetch_page = |param: Value| {
                let query_fn = Arc::clone(&query_fn);
                let context = QueryFnContext {
                    query_key: ctx.query_key.clone(),
                    signal: ctx.signal.clone(),
                    meta: ctx.meta.clone(),
                    page_param: Some(param),
                };
                async move { query_fn(context).await }
            };

            let old = ctx
                .data
                .as_deref()
                .map(InfiniteData::from_value)
                .unwrap_or_default();

            let data = match ctx.direction {
                Some(FetchDirection::Forward) => {
                    let mut data = old;
                    // End of the list: leave the payload untouched.
                    let Some(param) = (options.get_next_page_param)(&data) else {
                        return Ok(data.to_value());
                    };
                    let page = fetch_page(param.clone()).await?;
                    data.pages.push(page);
                    data.page_params.push(param);
                    if options.max_pages > 0 {
                        while data.pages.len() > options.max_pages {
                            data.pages.remove(0);
                            data.page_params.remove(0);
                        }
                    }
                    data
                }
                Some(FetchDirection::Backward) => {
                    let mut data = old;
                    let param = options
                        .get_previous_page_param
                        .as_ref()
                        .and_then(|get_previous| get_previous(&data));
                    let Some(param) = param else {
                        return Ok(data.to_value());
                    };
                    let page = fetch_page(param.clone()).await?;
                    data.pages.insert(0, page);
                    data.page_params.insert(0, param.clone());
                    if options.max_pages > 0 {
                        while data.pages.len() > options.max_pages {
                            data.pages.pop();
                            data.page_params.pop();
                        }
                    }
                    data
                }
                None => {
                    // Full fetch: replay the loaded page chain sequentially.
                    let remaining = pages_target.unwrap_or(old.pages.len()).max(1);
                    let mut data = InfiniteData::default();
                    for i in 0..remaining {
                        let param = if i == 0 {
                            old.page_params
                                .first()
                                .cloned()
                                .unwrap_or_else(|| options.initial_page_param.clone())
                        } else {
                            match (options.get_next_page_param)(&data) {
                                Some(param) => param,
                                None => break,
                            }
                        };
                        let page = fetch_page(param.clone()).await?;
                        data.pages.push(page);
                        data.page_params.push(param);
                    }
                    data
                }
            };
            Ok(data.to_value())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn behavior_ctx(
        data: Option<Value>,
        direction: Option<FetchDirection>,
    ) -> BehaviorContext {
        BehaviorContext {
            query_fn: crate::options::query_fn(|ctx: QueryFnContext| async move {
                let param = ctx.page_param.and_then(|p| p.as_u64()).unwrap_or(0);
                Ok(json!({ "page": param }))
            }),
            query_key: vec![json!("items")],
            signal: CancellationToken::new(),
            meta: None,
            direction,
            data: data.map(Arc::new),
        }
    }

    fn numbered(max: u64) -> InfiniteOptions {
        InfiniteOptions::new(json!(0), move |data: &InfiniteData| {
            let next = data.page_params.last().and_then(|p| p.as_u64())? + 1;
            (next < max).then(|| json!(next))
        })
        .with_previous_page_param(|data: &InfiniteData| {
            let first = data.page_params.first().and_then(|p| p.as_u64())?;
            first.checked_sub(1).map(|p| json!(p))
        })
    }

    #[tokio::test]
    async fn first_fetch_loads_initial_page() {
        let behavior = InfiniteQueryBehavior::new(numbered(10), None);
        let value = behavior.fetch(behavior_ctx(None, None)).await.expect("fetch");
        let data = InfiniteData::from_value(&value);
        assert_eq!(data.pages, vec![json!({"page": 0})]);
        assert_eq!(data.page_params, vec![json!(0)]);
    }

    #[tokio::test]
    async fn forward_fetch_appends() {
        let behavior = InfiniteQueryBehavior::new(numbered(10), None);
        let first = behavior.fetch(behavior_ctx(None, None)).await.expect("fetch");
        let value = behavior
            .fetch(behavior_ctx(Some(first), Some(FetchDirection::Forward)))
            .await
            .expect("fetch");
        let data = InfiniteData::from_value(&value);
        assert_eq!(data.pages.len(), 2);
        assert_eq!(data.page_params, vec![json!(0), json!(1)]);
    }

    #[tokio::test]
    async fn backward_fetch_prepends() {
        let seeded = InfiniteData {
            pages: vec![json!({"page": 2})],
            page_params: vec![json!(2)],
        };
        let behavior = InfiniteQueryBehavior::new(numbered(10), None);
        let value = behavior
            .fetch(behavior_ctx(
                Some(seeded.to_value()),
                Some(FetchDirection::Backward),
            ))
            .await
            .expect("fetch");
        let data = InfiniteData::from_value(&value);
        assert_eq!(data.page_params, vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn max_pages_trims_opposite_end() {
        let options = numbered(10).with_max_pages(2);
        let behavior = InfiniteQueryBehavior::new(options, None);
        let mut value = behavior.fetch(behavior_ctx(None, None)).await.expect("fetch");
        for _ in 0..3 {
            value = behavior
                .fetch(behavior_ctx(Some(value), Some(FetchDirection::Forward)))
                .await
                .expect("fetch");
        }
        let data = InfiniteData::from_value(&value);
        assert_eq!(data.page_params, vec![json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn refetch_replays_loaded_pages() {
        let behavior = InfiniteQueryBehavior::new(numbered(10), None);
        let mut value = behavior.fetch(behavior_ctx(None, None)).await.expect("fetch");
        for _ in 0..2 {
            value = behavior
                .fetch(behavior_ctx(Some(value), Some(FetchDirection::Forward)))
                .await
                .expect("fetch");
        }
        let refetched = behavior
            .fetch(behavior_ctx(Some(value), None))
            .await
            .expect("fetch");
        let data = InfiniteData::from_value(&refetched);
        assert_eq!(data.pages.len(), 3);
        assert_eq!(data.page_params, vec![json!(0), json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn end_of_list_leaves_payload_untouched() {
        let behavior = InfiniteQueryBehavior::new(numbered(1), None);
        let first = behavior.fetch(behavior_ctx(None, None)).await.expect("fetch");
        let value = behavior
            .fetch(behavior_ctx(Some(first.clone()), Some(FetchDirection::Forward)))
            .await
            .expect("fetch");
        assert_eq!(value, first);
    }

    #[test]
    fn page_existence_helpers() {
        let options = numbered(2);
        let empty = InfiniteData::default();
        assert!(!options.has_next_page(&empty));

        let one = InfiniteData {
            pages: vec![json!({"page": 0})],
            page_params: vec![json!(0)],
        };
        assert!(options.has_next_page(&one));
        assert!(!options.has_previous_page(&one));

        let last = InfiniteData {
            pages: vec![json!({"page": 1})],
            page_params: vec![json!(1)],
        };
        assert!(!options.has_next_page(&last));
        assert!(options.has_previous_page(&last));
    }
}
