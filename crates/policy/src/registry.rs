use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableScope {
    /// Rows belong to a tenant and must be filtered by the tenant column.
    TenantScoped,
    /// Reference data visible to every tenant.
    Shared,
}

/// Table name to scope mapping, plus the name of the tenant column shared by
/// every tenant-scoped table. Unregistered tables are never queryable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaRegistry {
    tenant_column: String,
    tables: BTreeMap<String, TableScope>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryError {
    pub message: String,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RegistryError {}

impl SchemaRegistry {
    pub const DEFAULT_TENANT_COLUMN: &'static str = "tenant_id";

    pub fn new(tenant_column: impl Into<String>) -> Result<Self, RegistryError> {
        let tenant_column = tenant_column.into().trim().to_ascii_lowercase();
        if !is_plain_identifier(&tenant_column) {
            return Err(RegistryError {
                message: format!("tenant column `{}` is not a plain identifier", tenant_column),
            });
        }

        Ok(Self {
            tenant_column,
            tables: BTreeMap::new(),
        })
    }

    pub fn tenant_column(&self) -> &str {
        &self.tenant_column
    }

    /// Registers or replaces a table. Later registrations win, which lets
    /// explicit configuration override introspected entries.
    pub fn insert(&mut self, table: &str, scope: TableScope) -> Result<(), RegistryError> {
        let key = normalize_table_name(table);
        if !key.split('.').all(is_plain_identifier) {
            return Err(RegistryError {
                message: format!("table name `{}` is not a plain identifier", table),
            });
        }
        self.tables.insert(key, scope);
        Ok(())
    }

    pub fn with_tenant_tables<I, S>(mut self, tables: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for table in tables {
            self.insert(table.as_ref(), TableScope::TenantScoped)?;
        }
        Ok(self)
    }

    pub fn with_shared_tables<I, S>(mut self, tables: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for table in tables {
            self.insert(table.as_ref(), TableScope::Shared)?;
        }
        Ok(self)
    }

    /// Resolves a possibly schema-qualified name. `public.users` falls back to
    /// `users` when only the bare name is registered.
    pub fn lookup(&self, table: &str) -> Option<TableScope> {
        let key = normalize_table_name(table);
        if let Some(scope) = self.tables.get(&key) {
            return Some(*scope);
        }
        let (schema, bare) = key.rsplit_once('.')?;
        if schema == "public" {
            self.tables.get(bare).copied()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn tables(&self) -> impl Iterator<Item = (&str, TableScope)> {
        self.tables.iter().map(|(name, scope)| (name.as_str(), *scope))
    }
}

pub(crate) fn normalize_table_name(table: &str) -> String {
    table.trim().to_ascii_lowercase()
}

fn is_plain_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new("tenant_id")
            .expect("tenant column should be valid")
            .with_tenant_tables(["users", "Orders"])
            .expect("tenant tables should register")
            .with_shared_tables(["countries"])
            .expect("shared tables should register")
    }

    #[test]
    fn lookup_is_case_insensitive_and_falls_back_from_public() {
        let registry = registry();
        assert_eq!(registry.lookup("USERS"), Some(TableScope::TenantScoped));
        assert_eq!(registry.lookup("orders"), Some(TableScope::TenantScoped));
        assert_eq!(registry.lookup("public.countries"), Some(TableScope::Shared));
        assert_eq!(registry.lookup("audit.users"), None);
        assert_eq!(registry.lookup("invoices"), None);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn later_registration_overrides_scope() {
        let mut registry = registry();
        registry
            .insert("countries", TableScope::TenantScoped)
            .expect("override should succeed");
        assert_eq!(registry.lookup("countries"), Some(TableScope::TenantScoped));
    }

    #[test]
    fn rejects_non_identifier_names() {
        assert!(SchemaRegistry::new("tenant-id").is_err());
        assert!(SchemaRegistry::new("").is_err());
        let mut registry = registry();
        let err = registry
            .insert("users; drop", TableScope::Shared)
            .unwrap_err();
        assert!(err.message.contains("not a plain identifier"));
    }
}
