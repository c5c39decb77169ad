//! Applies the resources of a batch of release docs.
//!
//! Plain docs are one unit of work each. Blue/green docs are split into one
//! unit per non-Service resource; their Services wait for the traffic switch.

use crate::error::Result;
use crate::kubernetes::{AppliedResource, ClusterContext};
use crate::output::OutputSink;
use crate::parallel::parallel_map;
use crate::release::ReleaseDoc;
use tracing::{debug, info};

/// What applying one doc did, aligned with `ReleaseDoc::resources`.
///
/// `None` marks a resource that was not applied: a deferred blue/green
/// Service or a resource that was deleted instead.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppliedDoc {
    pub resources: Vec<Option<AppliedResource>>,
}

impl AppliedDoc {
    pub fn previous(&self, index: usize) -> Option<&serde_json::Value> {
        self.resources
            .get(index)
            .and_then(Option::as_ref)
            .and_then(|applied| applied.previous.as_ref())
    }

    pub fn uid(&self, index: usize) -> Option<&str> {
        self.resources
            .get(index)
            .and_then(Option::as_ref)
            .and_then(|applied| applied.uid.as_deref())
    }
}

pub struct ResourceApplier<'a> {
    context: &'a ClusterContext,
    output: &'a dyn OutputSink,
    concurrency: usize,
}

impl<'a> ResourceApplier<'a> {
    pub fn new(context: &'a ClusterContext, output: &'a dyn OutputSink, concurrency: usize) -> Self {
        Self {
            context,
            output,
            concurrency,
        }
    }

    /// Deploy `docs`, returning one `AppliedDoc` per doc in the same order
    pub async fn deploy(&self, docs: &[&ReleaseDoc]) -> Result<Vec<AppliedDoc>> {
        self.context.warm(docs.iter().map(|doc| doc.cluster())).await?;

        let mut applied: Vec<AppliedDoc> = docs
            .iter()
            .map(|doc| AppliedDoc {
                resources: vec![None; doc.resources.len()],
            })
            .collect();

        let (blue_green, plain): (Vec<usize>, Vec<usize>) =
            (0..docs.len()).partition(|&i| docs[i].blue_green_color.is_some() && !docs[i].delete_resource);

        let this = self;
        let plain_docs: Vec<&ReleaseDoc> = plain.iter().map(|&i| docs[i]).collect();
        let plain_results = parallel_map(&plain_docs, self.concurrency, move |doc| {
            let doc: &ReleaseDoc = *doc;
            async move { this.deploy_doc(doc).await }
        })
        .await;
        for (&doc_index, result) in plain.iter().zip(plain_results) {
            applied[doc_index] = result?;
        }

        // (doc, resource) pairs of every non-Service blue/green resource
        let units: Vec<(usize, usize)> = blue_green
            .iter()
            .flat_map(|&d| {
                docs[d]
                    .resources
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| !r.is_service())
                    .map(move |(r, _)| (d, r))
            })
            .collect();
        let unit_results = parallel_map(&units, self.concurrency, move |&(d, r)| {
            let doc: &ReleaseDoc = docs[d];
            async move {
                let resource = &doc.resources[r];
                let api = this.context.client(doc.cluster()).await?;
                this.output.puts(&format!(
                    "Deploying {} {} for {}",
                    resource.kind,
                    resource.name(),
                    doc.label()
                ));
                resource.deploy(api.as_ref()).await
            }
        })
        .await;
        for (&(d, r), result) in units.iter().zip(unit_results) {
            applied[d].resources[r] = Some(result?);
        }

        info!(docs = docs.len(), "🚀 Applied release docs");
        Ok(applied)
    }

    async fn deploy_doc(&self, doc: &ReleaseDoc) -> Result<AppliedDoc> {
        let api = self.context.client(doc.cluster()).await?;
        let mut applied = AppliedDoc {
            resources: vec![None; doc.resources.len()],
        };

        if doc.delete_resource {
            self.output.puts(&format!("Deleting {}", doc.label()));
            for resource in &doc.resources {
                resource.delete(api.as_ref()).await?;
                debug!(resource = %resource.identity, "Deleted resource");
            }
            return Ok(applied);
        }

        self.output.puts(&format!("Deploying {}", doc.label()));
        for (index, resource) in doc.resources.iter().enumerate() {
            if doc.blue_green_color.is_some() && resource.is_service() {
                continue;
            }
            applied.resources[index] = Some(resource.deploy(api.as_ref()).await?);
        }
        Ok(applied)
    }
}
