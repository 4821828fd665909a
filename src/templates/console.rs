//! Console plugin resources served by the console Deployment

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::DynamicObject;
use serde_json::json;

use crate::store::{ObjectKey, ResourceKind};

pub const NGINX_CONFIG_MAP_NAME: &str = "ocs-client-operator-console-nginx-conf";
pub const SERVICE_NAME: &str = "ocs-client-operator-console-service";
pub const CONSOLE_PLUGIN_NAME: &str = "odf-client-console";

const SERVING_CERT_SECRET: &str = "ocs-client-operator-console-serving-cert";
const SERVING_CERT_ANNOTATION: &str = "service.beta.openshift.io/serving-cert-secret-name";
const NGINX_CONF_KEY: &str = "nginx.conf";

/// nginx configuration serving the plugin assets over TLS on `port`
pub fn nginx_conf(port: u16) -> String {
    format!(
        r#"error_log /dev/stdout info;
events {{}}
http {{
    access_log         /dev/stdout;
    include            /etc/nginx/mime.types;
    default_type       application/octet-stream;
    keepalive_timeout  65;
    server {{
        listen              {port} ssl;
        listen              [::]:{port} ssl;
        ssl_certificate     /var/serving-cert/tls.crt;
        ssl_certificate_key /var/serving-cert/tls.key;
        root                /usr/share/nginx/html;
    }}
}}
"#
    )
}

pub fn nginx_config_map(namespace: &str, port: u16) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(NGINX_CONFIG_MAP_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(NGINX_CONF_KEY.to_string(), nginx_conf(port))])),
        ..Default::default()
    }
}

/// Service in front of the console Deployment pods
pub fn console_service(namespace: &str, console_deployment: &str, port: u16) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(SERVICE_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            annotations: Some(BTreeMap::from([(
                SERVING_CERT_ANNOTATION.to_string(),
                SERVING_CERT_SECRET.to_string(),
            )])),
            labels: Some(BTreeMap::from([(
                "app".to_string(),
                console_deployment.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                "app".to_string(),
                console_deployment.to_string(),
            )])),
            ports: Some(vec![ServicePort {
                name: Some("console-port".to_string()),
                protocol: Some("TCP".to_string()),
                port: i32::from(port),
                target_port: Some(IntOrString::Int(i32::from(port))),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Cluster-scoped ConsolePlugin registration pointing at [`console_service`]
pub fn console_plugin(namespace: &str, port: u16) -> DynamicObject {
    let mut plugin = ObjectKey::cluster(ResourceKind::ConsolePlugin, CONSOLE_PLUGIN_NAME).shell();
    plugin.data = json!({
        "spec": {
            "displayName": "ODF Client Console",
            "backend": {
                "type": "Service",
                "service": {
                    "name": SERVICE_NAME,
                    "namespace": namespace,
                    "port": port,
                    "basePath": "/",
                },
            },
            "i18n": { "loadType": "Preload" },
        }
    });
    plugin
}
