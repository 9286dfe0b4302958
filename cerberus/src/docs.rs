//! OpenAPI 文档定义

use utoipa::OpenApi;

/// 管理接口的 OpenAPI 规范
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Cerberus Data Plane API",
        version = "0.1.0"
    ),
    paths(
        crate::web_api::health_check,
        crate::web_api::ready_check,
        crate::web_api::metrics,
        crate::web_api::get_ca_info,
        crate::web_api::download_ca,
        crate::web_api::regenerate_ca,
        crate::web_api::get_ca_fingerprint,
        crate::web_api::list_bypass,
        crate::web_api::add_bypass,
        crate::web_api::remove_bypass,
        crate::web_api::get_settings,
        crate::web_api::update_settings,
        crate::web_api::get_stats,
        crate::web_api::list_connections,
        crate::web_api::xdp_status,
        crate::web_api::list_rules,
        crate::web_api::create_rule,
        crate::web_api::get_rule,
        crate::web_api::update_rule,
        crate::web_api::delete_rule,
        crate::web_api::toggle_rule,
        crate::web_api::reorder_rules,
        crate::web_api::xdp_stats,
        crate::web_api::list_allowlist,
        crate::web_api::add_allowlist,
        crate::web_api::remove_allowlist,
        crate::web_api::list_denylist,
        crate::web_api::add_denylist,
        crate::web_api::remove_denylist,
    ),
    tags(
        (name = "system"),
        (name = "ca"),
        (name = "bypass"),
        (name = "proxy"),
        (name = "xdp")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_lists_paths() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/api/v1/ca/regenerate"));
        assert!(doc.paths.paths.contains_key("/healthz"));
        assert!(doc.paths.paths.contains_key("/api/v1/xdp/rules/{id}"));
        assert!(doc.paths.paths.contains_key("/api/v1/xdp/rules/reorder"));
        assert!(doc.paths.paths.contains_key("/api/v1/xdp/denylist/{ip}"));
        assert!(doc.paths.paths.contains_key("/api/v1/connections"));
        assert_eq!(doc.paths.paths.len(), 22);
    }
}
