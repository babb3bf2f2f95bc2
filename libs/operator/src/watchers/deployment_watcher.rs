use std::sync::Arc;

use futures::StreamExt;
use tracing::{error, warn};

use crate::build::{Build, BuildIndex};
use crate::cluster::{Cluster, DeploymentEvent};
use crate::error::Result;
use crate::labels::LABEL_BUILD;

use kube::ResourceExt;

/// Consumes the deployment watch stream and keeps the index authoritative. On start
/// (and whenever the stream restarts) the index is reset, so a relist never leaves
/// stale entries behind. Any error escapes to the caller, which is expected to be the
/// supervisor: it restarts this task with backoff.
pub async fn run_deployment_watcher(cluster: Arc<dyn Cluster>, index: Arc<BuildIndex>) -> Result<()> {
    index.reset();
    let mut stream = cluster.watch_deployments();
    while let Some(event) = stream.next().await {
        match event? {
            DeploymentEvent::Applied(deployment) => {
                if !deployment.labels().contains_key(LABEL_BUILD) {
                    continue;
                }
                match Build::from_deployment(&deployment) {
                    Ok(build) => index.add(build),
                    Err(err) => warn!(deployment = %deployment.name_any(), error = %err, "skipping malformed build deployment"),
                }
            }
            DeploymentEvent::Deleted(deployment) => {
                if let Some(name) = deployment.labels().get(LABEL_BUILD) {
                    index.remove(name);
                }
            }
            DeploymentEvent::Restarted => {
                index.reset();
            }
        }
    }
    error!("deployment watch stream ended");
    Ok(())
}
