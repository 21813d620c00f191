//! Executes single queries and chained bundles on the control connection.
//!
//! A bundle is an ordered set of named sub-queries dispatched together.
//! Sub-queries run concurrently, but every one of them completes before the
//! bundle resolves; any sub-failure collapses the whole bundle into a
//! single error and no partial results are surfaced.

use std::collections::HashMap;
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;

use crate::errors::RequestError;
use crate::frame::response::ResultSet;
use crate::transport::{ControlTransport, Statement};

/// An ordered set of named sub-queries issued together.
#[derive(Clone, Debug)]
pub(crate) struct QueryBundle {
    entries: Vec<(&'static str, Statement)>,
}

impl QueryBundle {
    pub(crate) fn new(key: &'static str, statement: Statement) -> Self {
        Self {
            entries: vec![(key, statement)],
        }
    }

    pub(crate) fn chain(mut self, key: &'static str, statement: Statement) -> Self {
        self.entries.push((key, statement));
        self
    }
}

/// Results of a bundle, keyed like its sub-queries. Missing keys are
/// normal: some sub-queries are only issued against newer servers.
#[derive(Debug, Default)]
pub(crate) struct BundleResults {
    results: HashMap<&'static str, ResultSet>,
}

impl BundleResults {
    pub(crate) fn result(&self, key: &str) -> Option<&ResultSet> {
        self.results.get(key)
    }
}

/// Runs one statement with the per-request timeout.
pub(crate) async fn run_query<T: ControlTransport>(
    transport: &T,
    timeout: Duration,
    statement: Statement,
) -> Result<ResultSet, RequestError> {
    match tokio::time::timeout(timeout, transport.query(statement)).await {
        Ok(result) => result,
        Err(_) => Err(RequestError::Timeout(timeout)),
    }
}

/// Runs all sub-queries of a bundle concurrently and collects their
/// results. The first sub-failure (in bundle order) becomes the bundle's
/// error, after every sub-query has completed.
pub(crate) async fn run_bundle<T: ControlTransport>(
    transport: &T,
    timeout: Duration,
    bundle: QueryBundle,
) -> Result<BundleResults, RequestError> {
    let sub_queries = bundle.entries.into_iter().map(|(key, statement)| {
        run_query(transport, timeout, statement).map(move |result| (key, result))
    });
    let completed = join_all(sub_queries).await;

    let mut results = HashMap::with_capacity(completed.len());
    let mut first_error = None;
    for (key, result) in completed {
        match result {
            Ok(result_set) => {
                results.insert(key, result_set);
            }
            Err(error) => {
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(BundleResults { results }),
    }
}
