//! Typed per-entity surface over [`Mutator`], e.g. `tasks_create`,
//! `tasks_update`, `tasks_delete`, `tasks_get`, `tasks_list`.

use paste::paste;
use serde_json::{Map, Value};

use crate::{
    mutators::Mutator,
    store::{ListOptions, Record},
    AppResult,
};

/// A caller-supplied string `id` is kept; otherwise a prefixed id is
/// generated for the table.
pub fn record_for(table: &str, fields: Map<String, Value>) -> AppResult<Record> {
    match fields.get("id").and_then(Value::as_str).map(str::trim) {
        Some(id) if !id.is_empty() => Ok(Record::new(id.to_string(), fields)),
        _ => Ok(Record::generate(table, fields)?),
    }
}

macro_rules! gen_entity_api {
    ( $( $table:ident ),+ $(,)? ) => {
        paste! {
            $(
                pub async fn [<$table _create>](
                    mutator: &Mutator,
                    fields: Map<String, Value>,
                ) -> AppResult<Record> {
                    let record = record_for(stringify!($table), fields)?;
                    mutator.create_with_sync(stringify!($table), record).await
                }

                pub async fn [<$table _update>](
                    mutator: &Mutator,
                    id: &str,
                    patch: Map<String, Value>,
                ) -> AppResult<Record> {
                    mutator.update_with_sync(stringify!($table), id, patch).await
                }

                pub async fn [<$table _delete>](mutator: &Mutator, id: &str) -> AppResult<bool> {
                    mutator.delete_with_sync(stringify!($table), id).await
                }

                pub async fn [<$table _get>](
                    mutator: &Mutator,
                    id: &str,
                ) -> AppResult<Option<Record>> {
                    mutator.get(stringify!($table), id).await
                }

                pub async fn [<$table _list>](
                    mutator: &Mutator,
                    options: &ListOptions,
                ) -> AppResult<Vec<Record>> {
                    mutator.list(stringify!($table), options).await
                }
            )+

            pub const ENTITY_TABLES: &[&str] = &[$(stringify!($table)),+];
        }
    };
}

gen_entity_api!(
    tasks,
    meals,
    maintenance_items,
    wallets,
    transactions,
    categories,
    keto_entries,
    shopping_items,
);
