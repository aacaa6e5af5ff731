//! Model Classification
//!
//! Every persisted entity declares its physical table name and whether it is
//! shared across tenants. Shared tables live in the public namespace and carry
//! its prefix (`public.tenants`); tenant tables are unqualified (`books`) and
//! are created inside each tenant's namespace.
//!
//! # Usage
//!
//! ```
//! use armature_tenancy::{ModelDescriptor, ModelRef, ModelRegistry};
//! use std::sync::Arc;
//!
//! let registry = ModelRegistry::new(
//!     vec![
//!         Arc::new(ModelDescriptor::shared("public.tenants")) as ModelRef,
//!         Arc::new(ModelDescriptor::tenant("books")) as ModelRef,
//!     ],
//!     "public",
//! )
//! .unwrap();
//!
//! assert_eq!(registry.shared_models().len(), 1);
//! assert_eq!(registry.tenant_models().len(), 1);
//! ```

use crate::error::{TenancyError, TenancyResult};
use crate::namespace;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Maximum length of [`TenantModel::domain_url`].
pub const MAX_DOMAIN_URL_LEN: usize = 128;

/// Classification contract for persisted entities.
pub trait TenantTabler: Send + Sync {
    /// Physical table name, `public.` prefixed for shared models.
    fn table_name(&self) -> String;

    /// Whether rows of this entity are shared by all tenants.
    fn is_shared_model(&self) -> bool;
}

/// Shared handle to a registered model.
pub type ModelRef = Arc<dyn TenantTabler>;

/// Plain table descriptor for callers without an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Table name.
    pub table: String,

    /// Shared flag.
    pub shared: bool,
}

impl ModelDescriptor {
    /// Describe a shared table (name must carry the public prefix).
    pub fn shared(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            shared: true,
        }
    }

    /// Describe a tenant table.
    pub fn tenant(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            shared: false,
        }
    }
}

impl TenantTabler for ModelDescriptor {
    fn table_name(&self) -> String {
        self.table.clone()
    }

    fn is_shared_model(&self) -> bool {
        self.shared
    }
}

/// A single model that violates the naming convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Shared model without the public prefix.
    MissingPublicPrefix {
        /// Offending table name.
        table: String,
        /// Expected prefix, e.g. `public.`.
        prefix: String,
    },

    /// Tenant model carrying a namespace qualifier.
    QualifiedTenantTable {
        /// Offending table name.
        table: String,
    },

    /// Model with an empty table name.
    EmptyTableName,
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::MissingPublicPrefix { table, prefix } => write!(
                f,
                "shared model table `{table}` must be prefixed with `{prefix}`"
            ),
            ModelError::QualifiedTenantTable { table } => write!(
                f,
                "tenant model table `{table}` must not contain a namespace qualifier"
            ),
            ModelError::EmptyTableName => write!(f, "model table name is empty"),
        }
    }
}

impl std::error::Error for ModelError {}

/// Registered models split into shared and tenant sets.
///
/// Immutable once built. Re-registration builds a new registry and replaces
/// the old one wholesale.
#[derive(Clone)]
pub struct ModelRegistry {
    shared: Vec<ModelRef>,
    tenant: Vec<ModelRef>,
}

impl ModelRegistry {
    /// Validate and partition `models`.
    ///
    /// Every model is checked; all violations are returned together in
    /// [`TenancyError::InvalidModels`]. Insertion order is preserved within
    /// each set.
    pub fn new(models: Vec<ModelRef>, public_schema: &str) -> TenancyResult<Self> {
        let prefix = namespace::shared_table_prefix(public_schema);
        let mut errors = Vec::new();
        let mut shared = Vec::new();
        let mut tenant = Vec::new();

        for model in models {
            match check_model(model.as_ref(), &prefix) {
                Ok(()) if model.is_shared_model() => shared.push(model),
                Ok(()) => tenant.push(model),
                Err(e) => errors.push(e),
            }
        }

        if !errors.is_empty() {
            return Err(TenancyError::InvalidModels(errors));
        }

        Ok(Self { shared, tenant })
    }

    /// Shared models, in registration order.
    pub fn shared_models(&self) -> &[ModelRef] {
        &self.shared
    }

    /// Tenant models, in registration order.
    pub fn tenant_models(&self) -> &[ModelRef] {
        &self.tenant
    }

    /// Number of registered models.
    pub fn len(&self) -> usize {
        self.shared.len() + self.tenant.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |models: &[ModelRef]| models.iter().map(|m| m.table_name()).collect::<Vec<_>>();
        f.debug_struct("ModelRegistry")
            .field("shared", &names(&self.shared[..]))
            .field("tenant", &names(&self.tenant[..]))
            .finish()
    }
}

fn check_model(model: &dyn TenantTabler, prefix: &str) -> Result<(), ModelError> {
    let table = model.table_name();
    if table.is_empty() {
        return Err(ModelError::EmptyTableName);
    }

    if model.is_shared_model() {
        if !table.starts_with(prefix) || table.len() == prefix.len() {
            return Err(ModelError::MissingPublicPrefix {
                table,
                prefix: prefix.to_string(),
            });
        }
    } else if table.contains('.') {
        return Err(ModelError::QualifiedTenantTable { table });
    }

    Ok(())
}

/// Fields embedded in a schema-per-tenant tenant entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantModel {
    /// Public hostname mapped to the tenant. Unique.
    pub domain_url: String,

    /// Namespace identifier. Unique.
    pub schema_name: String,
}

impl TenantModel {
    /// Create tenant fields.
    ///
    /// # Examples
    ///
    /// ```
    /// use armature_tenancy::TenantModel;
    ///
    /// let tenant = TenantModel::new("acme.example.com", "acme");
    /// assert!(tenant.validate().is_ok());
    /// ```
    pub fn new(domain_url: impl Into<String>, schema_name: impl Into<String>) -> Self {
        Self {
            domain_url: domain_url.into(),
            schema_name: schema_name.into(),
        }
    }

    /// Application-level check of the constraints the database may not enforce.
    pub fn validate(&self) -> TenancyResult<()> {
        validate_domain_url(&self.domain_url)?;
        namespace::validate(&self.schema_name)
    }

    /// Namespace identifier.
    pub fn namespace(&self) -> &str {
        &self.schema_name
    }
}

/// Variant of [`TenantModel`] whose primary key is the namespace identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantPkModel {
    /// Public hostname mapped to the tenant. Unique.
    pub domain_url: String,

    /// Primary key and namespace identifier.
    pub id: String,
}

impl TenantPkModel {
    /// Create tenant fields.
    pub fn new(domain_url: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            domain_url: domain_url.into(),
            id: id.into(),
        }
    }

    /// Application-level check of the constraints the database may not enforce.
    pub fn validate(&self) -> TenancyResult<()> {
        validate_domain_url(&self.domain_url)?;
        namespace::validate(&self.id)
    }

    /// Namespace identifier.
    pub fn namespace(&self) -> &str {
        &self.id
    }
}

fn validate_domain_url(domain_url: &str) -> TenancyResult<()> {
    if domain_url.trim().is_empty() {
        return Err(TenancyError::Config("domain URL is empty".to_string()));
    }
    if domain_url.len() > MAX_DOMAIN_URL_LEN {
        return Err(TenancyError::Config(format!(
            "domain URL exceeds {MAX_DOMAIN_URL_LEN} bytes"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Book;

    impl TenantTabler for Book {
        fn table_name(&self) -> String {
            "books".to_string()
        }

        fn is_shared_model(&self) -> bool {
            false
        }
    }

    fn models(list: Vec<ModelDescriptor>) -> Vec<ModelRef> {
        list.into_iter().map(|m| Arc::new(m) as ModelRef).collect()
    }

    #[test]
    fn test_partition() {
        let registry = ModelRegistry::new(
            models(vec![
                ModelDescriptor::shared("public.users"),
                ModelDescriptor::tenant("orders"),
            ]),
            "public",
        )
        .unwrap();

        assert_eq!(registry.shared_models()[0].table_name(), "public.users");
        assert_eq!(registry.tenant_models()[0].table_name(), "orders");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_preserves_insertion_order() {
        let mut list: Vec<ModelRef> = models(vec![
            ModelDescriptor::tenant("authors"),
            ModelDescriptor::shared("public.tenants"),
        ]);
        list.push(Arc::new(Book));
        list.push(Arc::new(ModelDescriptor::shared("public.plans")));

        let registry = ModelRegistry::new(list, "public").unwrap();
        let tenant: Vec<_> = registry.tenant_models().iter().map(|m| m.table_name()).collect();
        let shared: Vec<_> = registry.shared_models().iter().map(|m| m.table_name()).collect();

        assert_eq!(tenant, ["authors", "books"]);
        assert_eq!(shared, ["public.tenants", "public.plans"]);
    }

    #[test]
    fn test_shared_without_prefix_fails() {
        let err = ModelRegistry::new(models(vec![ModelDescriptor::shared("users")]), "public")
            .unwrap_err();
        assert!(matches!(
            err,
            TenancyError::InvalidModels(ref errors)
                if matches!(errors[0], ModelError::MissingPublicPrefix { .. })
        ));
    }

    #[test]
    fn test_tenant_with_prefix_fails() {
        let err = ModelRegistry::new(
            models(vec![ModelDescriptor::tenant("public.orders")]),
            "public",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TenancyError::InvalidModels(ref errors)
                if errors == &[ModelError::QualifiedTenantTable { table: "public.orders".into() }]
        ));
    }

    #[test]
    fn test_errors_are_joined() {
        let err = ModelRegistry::new(
            models(vec![
                ModelDescriptor::shared("users"),
                ModelDescriptor::tenant("public.orders"),
                ModelDescriptor::tenant("books"),
                ModelDescriptor::shared("public."),
            ]),
            "public",
        )
        .unwrap_err();

        match err {
            TenancyError::InvalidModels(errors) => assert_eq!(errors.len(), 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_custom_public_schema() {
        let registry = ModelRegistry::new(
            models(vec![ModelDescriptor::shared("shared.tenants")]),
            "shared",
        )
        .unwrap();
        assert_eq!(registry.shared_models().len(), 1);

        assert!(
            ModelRegistry::new(
                models(vec![ModelDescriptor::shared("public.tenants")]),
                "shared"
            )
            .is_err()
        );
    }

    #[test]
    fn test_tenant_model_validation() {
        assert!(TenantModel::new("acme.example.com", "acme").validate().is_ok());
        assert!(TenantModel::new("acme.example.com", "pg_acme").validate().is_err());
        assert!(TenantModel::new("", "acme").validate().is_err());
        assert!(TenantModel::new("a".repeat(129), "acme").validate().is_err());
        assert!(TenantPkModel::new("acme.example.com", "ab").validate().is_err());
        assert_eq!(TenantPkModel::new("acme.example.com", "acme").namespace(), "acme");
    }
}
