//! Traffic switch for blue/green rollouts.
//!
//! Services are applied only after the new color is live. The previous
//! color's compute is deleted afterwards; its Services are the same objects
//! that were just switched and stay in place.

use crate::error::Result;
use crate::kubernetes::ClusterContext;
use crate::output::OutputSink;
use crate::release::{Release, ReleaseDoc, ReleaseStore};
use tracing::info;

pub struct BlueGreenFinalizer<'a> {
    context: &'a ClusterContext,
    output: &'a dyn OutputSink,
    store: &'a dyn ReleaseStore,
}

impl<'a> BlueGreenFinalizer<'a> {
    pub fn new(
        context: &'a ClusterContext,
        output: &'a dyn OutputSink,
        store: &'a dyn ReleaseStore,
    ) -> Self {
        Self {
            context,
            output,
            store,
        }
    }

    /// Point Services of `docs` at the release's color, then tear down the
    /// previous succeeded release when it ran the other color
    pub async fn finalize(&self, release: &Release, docs: &[&ReleaseDoc]) -> Result<()> {
        let Some(color) = release.blue_green_color else {
            return Ok(());
        };

        for doc in docs.iter().filter(|d| !d.delete_resource) {
            let api = self.context.client(doc.cluster()).await?;
            for service in doc.services() {
                self.output.puts(&format!(
                    "Switching service {} of {} to {color}",
                    service.name(),
                    doc.label()
                ));
                service.deploy(api.as_ref()).await?;
            }
        }

        let Some(previous) = self
            .store
            .previous_succeeded(&release.project, release.id)
            .await?
        else {
            return Ok(());
        };
        let Some(previous_color) = previous.blue_green_color.filter(|c| *c != color) else {
            return Ok(());
        };

        for doc in &previous.docs {
            let api = self.context.client(doc.cluster()).await?;
            self.output.puts(&format!(
                "Deleting previous {previous_color} resources of {}",
                doc.label()
            ));
            for resource in doc.non_services() {
                resource.delete(api.as_ref()).await?;
            }
        }
        info!(
            release_id = release.id,
            previous_release_id = previous.id,
            color = %color,
            "🔀 Switched traffic"
        );
        Ok(())
    }
}
