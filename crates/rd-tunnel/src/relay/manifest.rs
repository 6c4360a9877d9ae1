//! Relay Pod manifest

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Pod, PodSpec, Probe, TCPSocketAction,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use rd_core::{SessionContext, SessionId};

pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

/// Value of the name label, and prefix of every relay Pod name
pub const RELAY_NAME: &str = "jkube-remote-dev";
pub const PART_OF: &str = "jkube-kit";

/// Env var the relay image reads its authorized key from
pub const PUBLIC_KEY_ENV: &str = "PUBLIC_KEY";

/// Name of the relay Pod of a session
pub fn pod_name(session_id: &SessionId) -> String {
    format!("{}-{}", RELAY_NAME, session_id)
}

/// Labels identifying the relay Pod of a session
pub fn pod_labels(session_id: &SessionId) -> BTreeMap<String, String> {
    BTreeMap::from([
        (NAME_LABEL.to_string(), RELAY_NAME.to_string()),
        (PART_OF_LABEL.to_string(), PART_OF.to_string()),
        (INSTANCE_LABEL.to_string(), session_id.to_string()),
    ])
}

/// Label selector matching relay Pods, all of them or those of one session
pub fn relay_selector(session_id: Option<&SessionId>) -> String {
    let mut selector = format!("{}={},{}={}", NAME_LABEL, RELAY_NAME, PART_OF_LABEL, PART_OF);
    if let Some(session_id) = session_id {
        selector.push_str(&format!(",{}={}", INSTANCE_LABEL, session_id));
    }
    selector
}

/// Build the relay Pod for a session
pub fn relay_pod(context: &SessionContext) -> Pod {
    let config = context.config();
    let relay_port = i32::from(config.relay.port);

    let mut ports = vec![ContainerPort {
        name: Some("ssh".to_string()),
        container_port: relay_port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }];
    ports.extend(config.local_services.iter().map(|local| ContainerPort {
        container_port: i32::from(local.port),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }));

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name(context.session_id())),
            labels: Some(pod_labels(context.session_id())),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: RELAY_NAME.to_string(),
                image: Some(config.relay.image.clone()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                ports: Some(ports),
                env: Some(vec![EnvVar {
                    name: PUBLIC_KEY_ENV.to_string(),
                    value: Some(context.authorized_key().to_string()),
                    ..Default::default()
                }]),
                readiness_probe: Some(Probe {
                    tcp_socket: Some(TCPSocketAction {
                        port: IntOrString::Int(relay_port),
                        ..Default::default()
                    }),
                    period_seconds: Some(1),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Render labels as `k=v, k=v` for log output
pub(crate) fn format_labels(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}
