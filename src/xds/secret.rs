//! DAG secret -> Envoy `Secret` conversion (SDS).

use std::collections::BTreeMap;

use envoy_types::pb::envoy::config::core::v3::{data_source::Specifier, DataSource};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    secret, CertificateValidationContext, Secret as EnvoySecret, TlsCertificate,
};
use envoy_types::pb::google::protobuf::Any;
use prost::Message;

use crate::dag::TlsSecret;
use crate::Result;

use super::resources::{BuiltResource, SECRET_TYPE_URL};

/// Build the SDS resource set from the DAG secrets, name-sorted. Keypair
/// secrets become `TlsCertificate`s; CA bundles become validation contexts.
pub fn secrets_from_map(secrets: &BTreeMap<String, TlsSecret>) -> Result<Vec<BuiltResource>> {
    secrets.values().map(build_secret).collect()
}

fn build_secret(secret: &TlsSecret) -> Result<BuiltResource> {
    let secret_type = match &secret.ca {
        Some(ca) => secret::Type::ValidationContext(CertificateValidationContext {
            trusted_ca: Some(inline(ca.clone())),
            ..Default::default()
        }),
        None => secret::Type::TlsCertificate(TlsCertificate {
            certificate_chain: Some(inline(secret.cert.clone())),
            private_key: Some(inline(secret.key.clone())),
            ..Default::default()
        }),
    };

    let envoy_secret = EnvoySecret { name: secret.name.clone(), r#type: Some(secret_type) };

    Ok(BuiltResource {
        name: secret.name.clone(),
        resource: Any {
            type_url: SECRET_TYPE_URL.to_string(),
            value: envoy_secret.encode_to_vec(),
        },
    })
}

fn inline(bytes: Vec<u8>) -> DataSource {
    DataSource { specifier: Some(Specifier::InlineBytes(bytes)), ..Default::default() }
}
