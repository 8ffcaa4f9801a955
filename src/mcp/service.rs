//! MCP service implementation using rmcp.
//!
//! Every tool answers with an [`OperationResponse`]: failures are reported in
//! the body with an `error_kind` instead of as protocol errors.
//!
//! Schemas are also readable as markdown resources:
//! `db://{backend}/schema` lists a backend's tables and
//! `db://{backend}/tables/{table}/schema` describes one table.

use std::sync::Arc;

use rmcp::Json;
use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler,
    handler::server::router::prompt::PromptRouter,
    handler::server::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::{
        AnnotateAble, GetPromptRequestParam, GetPromptResult, Implementation,
        ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult,
        PaginatedRequestParam, PromptMessage, PromptMessageRole, ProtocolVersion, RawResource,
        RawResourceTemplate, ReadResourceRequestParam, ReadResourceResult, ResourceContents,
        ServerCapabilities, ServerInfo,
    },
    prompt, prompt_handler, prompt_router,
    service::RequestContext,
    tool, tool_handler, tool_router,
};
use tracing::debug;

use crate::db::{BackendRegistry, QueryExecutor, SchemaInspector};
use crate::error::{DbError, DbResult, ErrorKind};
use crate::models::ConnectionStatus;
use crate::tools::query::{QueryInput, QueryOutput, QueryToolHandler, SampleDataInput};
use crate::tools::format::{format_table_list, format_table_schema};
use crate::tools::response::OperationResponse;
use crate::tools::schema::{
    BackendInput, DescribeTableInput, DescribeTableOutput, ListDatabasesInput,
    ListDatabasesOutput, ListSchemasInput, ListSchemasOutput, ListTablesInput, ListTablesOutput,
    SchemaToolHandler,
};

#[derive(Clone)]
pub struct DbService {
    registry: Arc<BackendRegistry>,
    executor: QueryExecutor,
    /// Tool router for MCP tool dispatch (auto-generated)
    tool_router: ToolRouter<Self>,
    prompt_router: PromptRouter<Self>,
}

const RESOURCE_SCHEME: &str = "db://";
const MARKDOWN: &str = "text/markdown";

/// What a `db://` resource URI points at.
#[derive(Debug, PartialEq, Eq)]
enum ResourceTarget<'a> {
    Backend(&'a str),
    Table { backend: &'a str, table: &'a str },
}

fn parse_resource_uri(uri: &str) -> Option<ResourceTarget<'_>> {
    let path = uri.strip_prefix(RESOURCE_SCHEME)?;
    let (backend, rest) = path.split_once('/')?;
    if backend.is_empty() {
        return None;
    }
    if rest == "schema" {
        return Some(ResourceTarget::Backend(backend));
    }
    let table = rest.strip_prefix("tables/")?.strip_suffix("/schema")?;
    if table.is_empty() || table.contains('/') {
        return None;
    }
    Some(ResourceTarget::Table { backend, table })
}

fn resource_error(uri: &str, err: DbError) -> McpError {
    match err.kind() {
        ErrorKind::NotFound => McpError::resource_not_found(err.user_message(), None),
        ErrorKind::UnsupportedOperation | ErrorKind::QueryValidationError => {
            McpError::invalid_params(err.user_message(), None)
        }
        _ => {
            debug!(uri, error = %err, "Resource read failed");
            McpError::internal_error(err.user_message(), None)
        }
    }
}

impl DbService {
    pub fn new(registry: Arc<BackendRegistry>, executor: QueryExecutor) -> Self {
        Self {
            registry,
            executor,
            tool_router: Self::tool_router(),
            prompt_router: Self::prompt_router(),
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    fn schema_handler(&self) -> SchemaToolHandler {
        SchemaToolHandler::new(Arc::clone(&self.registry))
    }

    fn query_handler(&self) -> QueryToolHandler {
        QueryToolHandler::new(Arc::clone(&self.registry), self.executor.clone())
    }

    fn resources(&self) -> Vec<rmcp::model::Resource> {
        self.registry
            .summaries()
            .into_iter()
            .map(|summary| {
                let mut raw = RawResource::new(
                    format!("{RESOURCE_SCHEME}{}/schema", summary.name),
                    format!("{} schema", summary.name),
                );
                raw.description = Some(format!("Tables in the {} backend", summary.backend_type));
                raw.mime_type = Some(MARKDOWN.to_string());
                raw.no_annotation()
            })
            .collect()
    }

    /// Render the markdown behind a `db://` resource URI.
    async fn resource_markdown(&self, uri: &str) -> DbResult<String> {
        let target = parse_resource_uri(uri).ok_or_else(|| DbError::NotFound {
            what: "Resource",
            name: uri.to_string(),
        })?;
        match target {
            ResourceTarget::Backend(name) => {
                let backend = self.registry.get(name)?;
                let list = SchemaInspector::list_tables(backend.as_ref(), None).await?;
                Ok(format_table_list(&list))
            }
            ResourceTarget::Table { backend: name, table } => {
                let backend = self.registry.get(name)?;
                let schema = SchemaInspector::describe_table(backend.as_ref(), table, None).await?;
                Ok(format_table_schema(&schema))
            }
        }
    }
}

#[prompt_router]
impl DbService {
    #[prompt(
        name = "explore_database",
        description = "Guided workflow for exploring a configured database"
    )]
    async fn explore_database(&self) -> Vec<PromptMessage> {
        vec![PromptMessage::new_text(
            PromptMessageRole::User,
            "Let's explore a database together:\n\n\
            1. Use `list_databases` to see every configured backend\n\
            2. Pick one and call `test_connection` with its `backend` name\n\
            3. Call `list_schemas` to see available schemas (not supported for SQLite)\n\
            4. Call `list_tables` to see the tables\n\
            5. For interesting tables, call `describe_table` to see their columns\n\
            6. Call `sample_data` with a small `limit` to preview rows\n\
            7. Based on the schema, suggest useful queries to extract insights\n\n\
            Backends are read-only unless configured otherwise."
                .to_string(),
        )]
    }

    #[prompt(
        name = "query_with_safety",
        description = "Instructions for writing safe parameterized queries"
    )]
    async fn query_with_safety(&self) -> Vec<PromptMessage> {
        vec![PromptMessage::new_text(
            PromptMessageRole::User,
            "Help me query a database safely:\n\n\
            1. I'll describe what data I need from which backend\n\
            2. Write a single SELECT (or WITH ... SELECT) query with positional placeholders:\n\
            \x20  - `$1`, `$2` for PostgreSQL\n\
            \x20  - `?` or `%s` for MySQL, SQLite and DB2\n\
            3. Pass the values separately in `params`, in placeholder order\n\
            4. Run it with `execute_query`\n\
            5. Present the results as a readable table\n\
            6. Suggest follow-up queries based on the results\n\n\
            Rules:\n\
            - Read-only backends accept one SELECT statement only\n\
            - Always pass values as `params`\n\
            - Never concatenate user input into SQL"
                .to_string(),
        )]
    }

    #[prompt(
        name = "analyze_table_structure",
        description = "Analyze a table's columns and likely relationships"
    )]
    async fn analyze_table_structure(&self) -> Vec<PromptMessage> {
        vec![PromptMessage::new_text(
            PromptMessageRole::User,
            "I need to analyze a table's structure:\n\n\
            1. Start with `list_databases` to see available backends\n\
            2. Call `list_tables` on the chosen backend\n\
            3. Call `describe_table` for the table I name\n\
            4. Analyze the columns:\n\
            \x20  - Identify primary keys and their types\n\
            \x20  - Look for foreign key naming patterns (columns ending in _id, _key)\n\
            \x20  - Note nullable and non-nullable columns\n\
            \x20  - Note what each data type implies\n\
            5. Suggest likely relationships with other tables\n\
            6. Recommend queries that validate those relationships\n\
            7. Provide sample queries to explore the data\n\n\
            Focus on the data model and how tables relate to each other."
                .to_string(),
        )]
    }
}

#[tool_router]
impl DbService {
    #[tool(
        description = "List all configured database backends.\nReturns names, types (PostgreSQL/MySQL/SQLite/DB2), read-only status and pool usage."
    )]
    async fn list_databases(
        &self,
        Parameters(input): Parameters<ListDatabasesInput>,
    ) -> Json<OperationResponse<ListDatabasesOutput>> {
        Json(OperationResponse::ok(self.schema_handler().list_databases(input)))
    }

    #[tool(
        description = "Check that a backend is reachable and report its server version.\nUnreachable backends return connected: false with the reason."
    )]
    async fn test_connection(
        &self,
        Parameters(input): Parameters<BackendInput>,
    ) -> Json<OperationResponse<ConnectionStatus>> {
        let result = self.schema_handler().test_connection(input).await;
        Json(OperationResponse::from_result("test_connection", result))
    }

    #[tool(
        description = "List schemas in a backend.\nNot supported for SQLite (returns unsupported_operation).\nOutput format: json (default) or markdown."
    )]
    async fn list_schemas(
        &self,
        Parameters(input): Parameters<ListSchemasInput>,
    ) -> Json<OperationResponse<ListSchemasOutput>> {
        let result = self.schema_handler().list_schemas(input).await;
        Json(OperationResponse::from_result("list_schemas", result))
    }

    #[tool(
        description = "List tables in a backend.\nDefaults to the backend's default schema (public for PostgreSQL, the connected database for MySQL, the current schema for DB2, main for SQLite).\nOutput format: json (default) or markdown."
    )]
    async fn list_tables(
        &self,
        Parameters(input): Parameters<ListTablesInput>,
    ) -> Json<OperationResponse<ListTablesOutput>> {
        let result = self.schema_handler().list_tables(input).await;
        Json(OperationResponse::from_result("list_tables", result))
    }

    #[tool(
        description = "Describe a table's columns in definition order: name, type, nullability, primary key and default.\nOutput format: json (default) or markdown."
    )]
    async fn describe_table(
        &self,
        Parameters(input): Parameters<DescribeTableInput>,
    ) -> Json<OperationResponse<DescribeTableOutput>> {
        let result = self.schema_handler().describe_table(input).await;
        Json(OperationResponse::from_result("describe_table", result))
    }

    #[tool(
        description = "Execute a SQL query and return rows.\nRead-only backends accept a single SELECT or WITH query only.\nUse positional parameters (?, $1 or %s) instead of inlining values.\nResults are capped at row_limit (default 100, max 1000); truncated is true when more rows existed.\nOutput format: json (default), table, or markdown."
    )]
    async fn execute_query(
        &self,
        Parameters(input): Parameters<QueryInput>,
    ) -> Json<OperationResponse<QueryOutput>> {
        let result = self.query_handler().execute_query(input).await;
        Json(OperationResponse::from_result("execute_query", result))
    }

    #[tool(
        description = "Return the first rows of a table (default 10, max 100).\nOutput format: json (default), table, or markdown."
    )]
    async fn sample_data(
        &self,
        Parameters(input): Parameters<SampleDataInput>,
    ) -> Json<OperationResponse<QueryOutput>> {
        let result = self.query_handler().sample_data(input).await;
        Json(OperationResponse::from_result("sample_data", result))
    }
}

#[tool_handler]
#[prompt_handler]
impl ServerHandler for DbService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_03_26,
            capabilities: ServerCapabilities::builder()
                .enable_prompts()
                .enable_resources()
                .enable_tools()
                .build(),
            server_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_owned(),
                title: Some("Multi-database MCP Server".to_owned()),
                version: env!("CARGO_PKG_VERSION").to_owned(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Database tools for exploring and querying PostgreSQL, MySQL, SQLite and DB2.\n\
                \n\
                ## Workflow\n\
                1. Call `list_databases` to get backend names\n\
                2. Use `backend` from step 1 in all other tool calls\n\
                3. Explore with `list_schemas`, `list_tables`, `describe_table`, `sample_data`\n\
                4. Query with `execute_query`, passing values as `params`\n\
                \n\
                ## Responses\n\
                Every tool returns `success`. On failure, `error_kind` is one of:\n\
                configuration_error, connection_error, pool_exhausted, query_validation_error,\n\
                query_execution_error, unsupported_operation, not_found, internal_error.\n\
                \n\
                ## Read-only backends\n\
                Backends are read-only unless configured otherwise. Only a single SELECT\n\
                (or WITH ... SELECT) statement is accepted; anything else returns\n\
                query_validation_error naming the rejected keyword.\n\
                \n\
                ## Resources\n\
                `db://{backend}/schema` and `db://{backend}/tables/{table}/schema`\n\
                return markdown schema summaries."
                    .to_string(),
            ),
        }
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        Ok(ListResourcesResult::with_all_items(self.resources()))
    }

    async fn list_resource_templates(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        let template = RawResourceTemplate {
            uri_template: format!("{RESOURCE_SCHEME}{{backend}}/tables/{{table}}/schema"),
            name: "table schema".to_string(),
            title: None,
            description: Some("Columns of one table as markdown".to_string()),
            mime_type: Some(MARKDOWN.to_string()),
        };
        Ok(ListResourceTemplatesResult::with_all_items(vec![
            template.no_annotation(),
        ]))
    }

    async fn read_resource(
        &self,
        ReadResourceRequestParam { uri }: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        let text = self
            .resource_markdown(&uri)
            .await
            .map_err(|e| resource_error(&uri, e))?;
        Ok(ReadResourceResult {
            contents: vec![ResourceContents::text(text, uri)],
        })
    }
}
