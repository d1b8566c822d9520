use sqlx::SqliteConnection;

use shared_types::Category;

use super::StoreError;

/// Add a category. A duplicate name fails with [`StoreError::Conflict`].
pub async fn add(conn: &mut SqliteConnection, name: &str) -> Result<Category, StoreError> {
    let category = Category {
        id: uuid::Uuid::new_v4().simple().to_string(),
        name: name.to_string(),
    };

    sqlx::query("INSERT INTO categories (id, name) VALUES (?, ?)")
        .bind(&category.id)
        .bind(&category.name)
        .execute(&mut *conn)
        .await
        .map_err(|e| match StoreError::from(e) {
            StoreError::Conflict(_) => {
                StoreError::Conflict(format!("category '{name}' already exists"))
            }
            other => other,
        })?;

    Ok(category)
}

pub async fn names(conn: &mut SqliteConnection) -> Result<Vec<String>, StoreError> {
    let names = sqlx::query_scalar::<_, String>("SELECT name FROM categories ORDER BY name")
        .fetch_all(&mut *conn)
        .await?;
    Ok(names)
}
