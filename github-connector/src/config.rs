//! Tuning constants and the discussions GraphQL query.

pub const MAX_COMMENT_COUNT: usize = 100;
pub const MAX_CONTENT_LENGTH: usize = 100_000;
pub const ITEMS_PER_PAGE: usize = 100;
pub const CHECKPOINT_INTERVAL: usize = 50;

pub const DISCUSSIONS_QUERY: &str = r#"
query($owner: String!, $name: String!, $cursor: String) {
  repository(owner: $owner, name: $name) {
    discussions(first: 100, after: $cursor, orderBy: {field: UPDATED_AT, direction: DESC}) {
      pageInfo {
        hasNextPage
        endCursor
      }
      nodes {
        number
        title
        body
        url
        createdAt
        updatedAt
        author { login }
        category { name }
        answerChosenAt
        labels(first: 10) { nodes { name } }
        comments(first: 100) {
          nodes {
            body
            createdAt
            author { login }
          }
        }
      }
    }
  }
}
"#;
