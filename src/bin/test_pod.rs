//! Creates a pod that will sit Pending/Unschedulable until a node can
//! satisfy it, for exercising the provisioning path against a live
//! cluster. Usage: test_pod <name> <cpu> <memory> [gpu-count]

use std::collections::BTreeMap;

use anyhow::{Context, bail};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{ObjectMeta, PostParams};
use kube::{Api, Client};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();
    let args: Vec<String> = std::env::args().collect();
    let [_, name, cpu, memory, rest @ ..] = args.as_slice() else {
        bail!("usage: test_pod <name> <cpu> <memory> [gpu-count]");
    };
    let gpu: Option<u32> = rest.first().map(|g| g.parse()).transpose()?;

    let client = Client::try_default().await.context("kubernetes client")?;
    let pods: Api<Pod> = Api::default_namespaced(client);

    let mut requests = BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.clone())),
        ("memory".to_string(), Quantity(memory.clone())),
    ]);
    if let Some(n) = gpu {
        requests.insert("nvidia.com/gpu".into(), Quantity(n.to_string()));
    }

    let pod = Pod {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            labels: Some(BTreeMap::from([(
                "app.kubernetes.io/managed-by".to_string(),
                "canopy-test".to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "worker".into(),
                image: Some("busybox".into()),
                command: Some(vec!["sleep".into(), "infinity".into()]),
                resources: Some(ResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    };

    pods.create(&PostParams::default(), &pod).await?;
    info!(pod = %name, cpu, memory, gpu = ?gpu, "created test pod");
    Ok(())
}
