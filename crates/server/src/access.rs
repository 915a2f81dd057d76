//! Access Control: resolves a principal's role within a threat model and
//! authorizes session join/resume requests.

use tmi_common::{AppError, Principal, Role, ThreatModelRef};
use uuid::Uuid;

use crate::directory::ThreatModelDirectory;

/// Resolve `principal`'s role within `threat_model`.
///
/// Order of evaluation: the threat model's owner always resolves to
/// `Owner`; otherwise the authorization list is searched by email; an
/// admin principal with no explicit entry is granted owner-equivalent
/// access; anyone else holds `Role::None`.
pub fn resolve_role(principal: &Principal, threat_model: &ThreatModelRef) -> Role {
    if threat_model.owner_user_id == principal.user_id {
        return Role::Owner;
    }
    if let Some(entry) = threat_model
        .authorization
        .iter()
        .find(|e| e.subject.eq_ignore_ascii_case(&principal.email))
    {
        return entry.role;
    }
    if principal.admin {
        return Role::Owner;
    }
    Role::None
}

/// Look up the threat model a diagram belongs to and resolve the
/// principal's role within it, verifying the diagram is actually one of
/// that threat model's diagrams.
///
/// Returns `AppError::NotFound` when the diagram doesn't belong to the
/// named threat model at all, and `Role::None` (not an error) when the
/// principal simply has no access — callers decide whether `None` means
/// `Forbidden` or, for read-only listing endpoints, a filtered-out row.
pub async fn resolve_diagram_role(
    directory: &dyn ThreatModelDirectory,
    principal: &Principal,
    threat_model_id: Uuid,
    diagram_id: Uuid,
) -> Result<Role, AppError> {
    if !directory
        .diagram_belongs_to(threat_model_id, diagram_id)
        .await?
    {
        return Err(AppError::NotFound);
    }
    let threat_model = directory.get(threat_model_id).await?;
    Ok(resolve_role(principal, &threat_model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tmi_common::AuthorizationEntry;

    fn principal(email: &str, admin: bool) -> Principal {
        Principal {
            user_id: Uuid::new_v4(),
            email: email.to_string(),
            provider: "test".to_string(),
            admin,
        }
    }

    fn threat_model(owner: Uuid, entries: Vec<AuthorizationEntry>) -> ThreatModelRef {
        ThreatModelRef {
            id: Uuid::new_v4(),
            owner_user_id: owner,
            authorization: entries,
        }
    }

    #[test]
    fn owner_resolves_to_owner_role() {
        let p = principal("owner@example.com", false);
        let tm = threat_model(p.user_id, vec![]);
        assert_eq!(resolve_role(&p, &tm), Role::Owner);
    }

    #[test]
    fn authorization_list_entry_is_honored() {
        let p = principal("writer@example.com", false);
        let tm = threat_model(
            Uuid::new_v4(),
            vec![AuthorizationEntry {
                subject: "writer@example.com".to_string(),
                role: Role::Writer,
            }],
        );
        assert_eq!(resolve_role(&p, &tm), Role::Writer);
    }

    #[test]
    fn authorization_lookup_is_case_insensitive() {
        let p = principal("Writer@Example.com", false);
        let tm = threat_model(
            Uuid::new_v4(),
            vec![AuthorizationEntry {
                subject: "writer@example.com".to_string(),
                role: Role::Writer,
            }],
        );
        assert_eq!(resolve_role(&p, &tm), Role::Writer);
    }

    #[test]
    fn admin_without_entry_gets_owner_equivalent() {
        let p = principal("admin@example.com", true);
        let tm = threat_model(Uuid::new_v4(), vec![]);
        assert_eq!(resolve_role(&p, &tm), Role::Owner);
    }

    #[test]
    fn unrelated_principal_gets_none() {
        let p = principal("stranger@example.com", false);
        let tm = threat_model(Uuid::new_v4(), vec![]);
        assert_eq!(resolve_role(&p, &tm), Role::None);
    }

    #[tokio::test]
    async fn diagram_not_in_threat_model_is_not_found() {
        use crate::directory::InMemoryDirectory;
        let dir = InMemoryDirectory::new();
        let tm_id = Uuid::new_v4();
        dir.insert_threat_model(threat_model(Uuid::new_v4(), vec![]));
        let p = principal("x@example.com", false);
        let result = resolve_diagram_role(&dir, &p, tm_id, Uuid::new_v4()).await;
        assert!(matches!(result, Err(AppError::NotFound)));
    }
}
