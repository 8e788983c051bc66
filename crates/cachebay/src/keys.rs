//! Storage-key derivation shared by the Normalizer and Materializer.
//!
//! A field's storage key inside its parent [`Record`](cachebay_types::Record)
//! is its name plus its stringified arguments when it takes any — the same
//! "fieldName(args)" convention `spec.md` §6 specifies for page records,
//! generalized to every field so two differently-argumented invocations of
//! an aliased field never collide in the flat store (`response_key`, the
//! alias, is reserved for the *reconstructed tree* instead).

use cachebay_types::{SelectionField, Variables};

pub fn field_storage_key(field: &SelectionField, variables: &Variables) -> String {
    let args = (field.stringify_args)(variables);
    if args == "{}" {
        field.field_name.clone()
    } else {
        format!("{}({})", field.field_name, args)
    }
}
