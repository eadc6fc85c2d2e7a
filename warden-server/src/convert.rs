//! Conversions between domain types and protobuf messages.

use tonic::Status;
use warden_core::{Bundle, RegistrationEntry, Selector, SpiffeId};
use warden_proto::types::v1 as pb;

pub fn selector_to_proto(s: &Selector) -> pb::Selector {
    pb::Selector {
        r#type: s.selector_type.clone(),
        value: s.value.clone(),
    }
}

pub fn selector_from_proto(p: pb::Selector) -> Selector {
    Selector::new(p.r#type, p.value)
}

pub fn entry_to_proto(e: &RegistrationEntry) -> pb::RegistrationEntry {
    pb::RegistrationEntry {
        entry_id: e.entry_id.clone(),
        parent_id: e.parent_id.to_string(),
        spiffe_id: e.spiffe_id.to_string(),
        selectors: e.selectors.iter().map(selector_to_proto).collect(),
        ttl: e.ttl,
        federates_with: e.federates_with.iter().map(|td| td.to_string()).collect(),
        admin: e.admin,
        downstream: e.downstream,
        expires_at: e.expires_at,
        dns_names: e.dns_names.clone(),
    }
}

pub fn entry_from_proto(p: pb::RegistrationEntry) -> Result<RegistrationEntry, Status> {
    let parent_id = SpiffeId::parse(&p.parent_id)
        .map_err(|e| Status::invalid_argument(format!("invalid parent ID: {e}")))?;
    let spiffe_id = SpiffeId::parse(&p.spiffe_id)
        .map_err(|e| Status::invalid_argument(format!("invalid SPIFFE ID: {e}")))?;
    let federates_with = p
        .federates_with
        .iter()
        .map(|td| {
            SpiffeId::parse(td).map_err(|e| {
                Status::invalid_argument(format!("invalid federated trust-domain ID: {e}"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(RegistrationEntry {
        entry_id: p.entry_id,
        parent_id,
        spiffe_id,
        selectors: p.selectors.into_iter().map(selector_from_proto).collect(),
        ttl: p.ttl,
        federates_with,
        admin: p.admin,
        downstream: p.downstream,
        expires_at: p.expires_at,
        dns_names: p.dns_names,
    })
}

pub fn bundle_to_proto(b: &Bundle) -> pb::Bundle {
    pb::Bundle {
        trust_domain_id: b.trust_domain_id.clone(),
        root_cas: b.root_cas.clone(),
    }
}
