use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;

use crate::analytics::SteeringSnapshot;
use crate::buffer_pool::{BufferPool, BufferPoolStats};
use crate::docs::ApiDoc;
use crate::inspector::bypass::BypassMatcher;
use crate::inspector::ca::{CaError, CaInfo, CaManager, CaStats};
use crate::inspector::connections::{ConnectionTable, ConnectionView, ProxyStats, ProxyTotals};
use crate::inspector::proxy::ProxyContext;
use crate::inspector::{InspectionSettings, SettingsUpdate, SettingsView};
use crate::metrics::Metrics;
use crate::steering::rules::{RuleError, RuleRequest, RuleView};
use crate::steering::{HostList, SteeringService, SteeringStatus};

// API 响应结构
#[derive(Serialize, Debug)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            timestamp: Utc::now(),
        }
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::success(data)))
}

// 错误统一转换为带状态码的 JSON
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("不支持的请求方法")]
    MethodNotAllowed,
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(msg) = &self {
            warn!("API 内部错误: {}", msg);
        }
        (self.status(), Json(ApiResponse::<()>::error(self.to_string()))).into_response()
    }
}

impl From<RuleError> for ApiError {
    fn from(e: RuleError) -> Self {
        match e {
            RuleError::Invalid(_) | RuleError::SlotTaken { .. } | RuleError::TableFull => {
                ApiError::BadRequest(e.to_string())
            }
            RuleError::NotFound(_) | RuleError::HostNotFound { .. } => {
                ApiError::NotFound(e.to_string())
            }
            RuleError::Map(_) | RuleError::Storage(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<CaError> for ApiError {
    fn from(e: CaError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

/// 请求体解析失败一律 400
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| ApiError::BadRequest(format!("请求体无效: {}", e.body_text())))
}

// 应用状态
#[derive(Clone)]
pub struct AppState {
    pub steering: Arc<SteeringService>,
    pub ca: Arc<CaManager>,
    pub bypass: Arc<BypassMatcher>,
    pub settings: Arc<InspectionSettings>,
    pub connections: Arc<ConnectionTable>,
    pub proxy_stats: Arc<ProxyStats>,
    pub pool: BufferPool,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(proxy: &ProxyContext, steering: Arc<SteeringService>, metrics: Metrics) -> Self {
        Self {
            steering,
            ca: proxy.ca.clone(),
            bypass: proxy.bypass.clone(),
            settings: proxy.settings.clone(),
            connections: proxy.connections.clone(),
            proxy_stats: proxy.stats.clone(),
            pool: proxy.pool.clone(),
            metrics,
        }
    }
}

// === 健康检查与指标 ===

#[derive(Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub service: &'static str,
}

/// 存活检查
#[utoipa::path(get, path = "/healthz", tag = "system", responses((status = 200, description = "服务存活")))]
pub async fn health_check() -> ApiResult<HealthStatus> {
    ok(HealthStatus {
        status: "healthy",
        service: "cerberus",
    })
}

#[derive(Serialize)]
pub struct ReadyStatus {
    pub ready: bool,
    pub xdp_attached: bool,
    pub active_connections: usize,
}

/// 就绪检查，XDP 未挂载不影响就绪
#[utoipa::path(get, path = "/readyz", tag = "system", responses((status = 200, description = "服务就绪")))]
pub async fn ready_check(State(state): State<AppState>) -> ApiResult<ReadyStatus> {
    ok(ReadyStatus {
        ready: true,
        xdp_attached: state.steering.status().await.attached,
        active_connections: state.connections.len(),
    })
}

/// Prometheus 文本格式
#[utoipa::path(get, path = "/metrics", tag = "system", responses((status = 200, description = "Prometheus 指标")))]
pub async fn metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    state
        .metrics
        .buffer_pool_available
        .set(state.pool.available() as i64);
    let text = state
        .metrics
        .export()
        .map_err(|e| ApiError::Internal(format!("导出指标失败: {:#}", e)))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        text,
    )
        .into_response())
}

// === CA ===

/// CA 证书信息
#[utoipa::path(get, path = "/api/v1/ca", tag = "ca", responses((status = 200, description = "CA 指纹与主题")))]
pub async fn get_ca_info(State(state): State<AppState>) -> ApiResult<CaInfo> {
    ok(state.ca.info())
}

/// 下载 PEM 格式根证书
#[utoipa::path(get, path = "/api/v1/ca/download", tag = "ca", responses((status = 200, description = "PEM 证书")))]
pub async fn download_ca(State(state): State<AppState>) -> Response {
    (
        [
            (header::CONTENT_TYPE, "application/x-pem-file"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"cerberus-ca.crt\"",
            ),
        ],
        state.ca.cert_pem(),
    )
        .into_response()
}

#[derive(Serialize)]
pub struct FingerprintView {
    pub algorithm: &'static str,
    pub fingerprint: String,
}

/// 根证书 SHA-256 指纹
#[utoipa::path(get, path = "/api/v1/ca/fingerprint", tag = "ca", responses((status = 200, description = "指纹")))]
pub async fn get_ca_fingerprint(State(state): State<AppState>) -> ApiResult<FingerprintView> {
    ok(FingerprintView {
        algorithm: "sha256",
        fingerprint: state.ca.fingerprint(),
    })
}

/// 重新生成根证书，已缓存的叶子证书全部作废
#[utoipa::path(post, path = "/api/v1/ca/regenerate", tag = "ca", responses((status = 200, description = "新的 CA 信息"), (status = 500, description = "生成失败，原证书保留")))]
pub async fn regenerate_ca(State(state): State<AppState>) -> ApiResult<CaInfo> {
    let ca = state.ca.clone();
    let info = tokio::task::spawn_blocking(move || ca.regenerate())
        .await
        .map_err(|e| ApiError::Internal(format!("CA 重新生成任务失败: {}", e)))??;
    ok(info)
}

// === 旁路域名 ===

#[derive(Deserialize)]
pub struct BypassRequest {
    pub domain: Option<String>,
}

#[derive(Serialize)]
pub struct BypassResult {
    pub domain: String,
    pub added: bool,
}

/// 旁路域名列表
#[utoipa::path(get, path = "/api/v1/bypass", tag = "bypass", responses((status = 200, description = "旁路域名")))]
pub async fn list_bypass(State(state): State<AppState>) -> ApiResult<Vec<String>> {
    ok(state.bypass.list().await)
}

/// 添加旁路域名，重复添加返回 added=false
#[utoipa::path(post, path = "/api/v1/bypass", tag = "bypass", responses((status = 200, description = "已添加"), (status = 400, description = "domain 缺失或为空")))]
pub async fn add_bypass(
    State(state): State<AppState>,
    payload: Result<Json<BypassRequest>, JsonRejection>,
) -> ApiResult<BypassResult> {
    let request = json_body(payload)?;
    let raw = request.domain.unwrap_or_default();
    let added = state
        .bypass
        .add(&raw)
        .await
        .ok_or_else(|| ApiError::BadRequest("domain 不能为空".to_string()))?;
    let domain = crate::inspector::bypass::normalize(&raw);
    if added {
        info!("添加旁路域名 {}", domain);
    }
    ok(BypassResult { domain, added })
}

#[utoipa::path(delete, path = "/api/v1/bypass/{domain}", tag = "bypass", params(("domain" = String, Path, description = "旁路域名")), responses((status = 200, description = "已移除"), (status = 404, description = "域名不存在")))]
pub async fn remove_bypass(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> ApiResult<String> {
    if !state.bypass.remove(&domain).await {
        return Err(ApiError::NotFound(format!("旁路域名 {} 不存在", domain)));
    }
    info!("移除旁路域名 {}", domain);
    ok(crate::inspector::bypass::normalize(&domain))
}

// === 设置与统计 ===

#[utoipa::path(get, path = "/api/v1/settings", tag = "proxy", responses((status = 200, description = "当前开关")))]
pub async fn get_settings(State(state): State<AppState>) -> ApiResult<SettingsView> {
    ok(state.settings.view())
}

/// 部分更新开关，缺省字段不变
#[utoipa::path(put, path = "/api/v1/settings", tag = "proxy", responses((status = 200, description = "更新后的开关"), (status = 400, description = "请求体无效")))]
pub async fn update_settings(
    State(state): State<AppState>,
    payload: Result<Json<SettingsUpdate>, JsonRejection>,
) -> ApiResult<SettingsView> {
    let update = json_body(payload)?;
    let view = state.settings.apply(update);
    info!(
        "设置已更新: inspect_https={}, log_connections={}",
        view.inspect_https, view.log_connections
    );
    ok(view)
}

#[derive(Serialize)]
pub struct ServiceStats {
    pub proxy: ProxyTotals,
    pub ca: CaStats,
    pub buffer_pool: BufferPoolStats,
}

/// 代理、CA 和缓冲池统计
#[utoipa::path(get, path = "/api/v1/stats", tag = "proxy", responses((status = 200, description = "汇总统计")))]
pub async fn get_stats(State(state): State<AppState>) -> ApiResult<ServiceStats> {
    ok(ServiceStats {
        proxy: state.proxy_stats.snapshot(),
        ca: state.ca.stats(),
        buffer_pool: state.pool.stats(),
    })
}

/// 活动隧道
#[utoipa::path(get, path = "/api/v1/connections", tag = "proxy", responses((status = 200, description = "活动连接列表")))]
pub async fn list_connections(State(state): State<AppState>) -> ApiResult<Vec<ConnectionView>> {
    ok(state.connections.list())
}

// === XDP 分类器 ===

#[utoipa::path(get, path = "/api/v1/xdp/status", tag = "xdp", responses((status = 200, description = "挂载状态")))]
pub async fn xdp_status(State(state): State<AppState>) -> ApiResult<SteeringStatus> {
    ok(state.steering.status().await)
}

fn parse_rule_id(raw: &str) -> Result<u32, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("无效的规则 id: {}", raw)))
}

/// 按优先级排列的规则
#[utoipa::path(get, path = "/api/v1/xdp/rules", tag = "xdp", responses((status = 200, description = "规则列表")))]
pub async fn list_rules(State(state): State<AppState>) -> ApiResult<Vec<RuleView>> {
    ok(state.steering.list_rules().await)
}

/// 新建规则，priority 即槽位
#[utoipa::path(post, path = "/api/v1/xdp/rules", tag = "xdp", responses((status = 200, description = "已创建"), (status = 400, description = "参数无效或槽位冲突")))]
pub async fn create_rule(
    State(state): State<AppState>,
    payload: Result<Json<RuleRequest>, JsonRejection>,
) -> ApiResult<RuleView> {
    let request = json_body(payload)?;
    ok(state.steering.create_rule(request).await?)
}

#[utoipa::path(get, path = "/api/v1/xdp/rules/{id}", tag = "xdp", params(("id" = u32, Path, description = "规则 id")), responses((status = 200, description = "规则"), (status = 404, description = "规则不存在")))]
pub async fn get_rule(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<RuleView> {
    let id = parse_rule_id(&id)?;
    ok(state.steering.get_rule(id).await?)
}

#[utoipa::path(put, path = "/api/v1/xdp/rules/{id}", tag = "xdp", params(("id" = u32, Path, description = "规则 id")), responses((status = 200, description = "已更新"), (status = 400, description = "参数无效或槽位冲突"), (status = 404, description = "规则不存在")))]
pub async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<RuleRequest>, JsonRejection>,
) -> ApiResult<RuleView> {
    let id = parse_rule_id(&id)?;
    let request = json_body(payload)?;
    ok(state.steering.update_rule(id, request).await?)
}

#[utoipa::path(delete, path = "/api/v1/xdp/rules/{id}", tag = "xdp", params(("id" = u32, Path, description = "规则 id")), responses((status = 200, description = "已删除"), (status = 404, description = "规则不存在")))]
pub async fn delete_rule(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<u32> {
    let id = parse_rule_id(&id)?;
    state.steering.delete_rule(id).await?;
    ok(id)
}

#[utoipa::path(post, path = "/api/v1/xdp/rules/{id}/toggle", tag = "xdp", params(("id" = u32, Path, description = "规则 id")), responses((status = 200, description = "切换后的规则"), (status = 404, description = "规则不存在")))]
pub async fn toggle_rule(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<RuleView> {
    let id = parse_rule_id(&id)?;
    ok(state.steering.toggle_rule(id).await?)
}

#[derive(Deserialize)]
pub struct ReorderRequest {
    pub rule_order: Option<Vec<u32>>,
}

/// 按 rule_order 重排规则，依次放入槽位 0..n
#[utoipa::path(post, path = "/api/v1/xdp/rules/reorder", tag = "xdp", responses((status = 200, description = "重排后的规则列表"), (status = 400, description = "rule_order 缺失、为空或有重复"), (status = 404, description = "规则不存在")))]
pub async fn reorder_rules(
    State(state): State<AppState>,
    payload: Result<Json<ReorderRequest>, JsonRejection>,
) -> ApiResult<Vec<RuleView>> {
    let request = json_body(payload)?;
    let order = request
        .rule_order
        .filter(|order| !order.is_empty())
        .ok_or_else(|| ApiError::BadRequest("rule_order 不能为空".to_string()))?;
    ok(state.steering.reorder_rules(&order).await?)
}

#[derive(Serialize)]
pub struct XdpStats {
    pub attached: bool,
    pub snapshot: Option<SteeringSnapshot>,
}

/// 全局与逐规则计数、速率
#[utoipa::path(get, path = "/api/v1/xdp/stats", tag = "xdp", responses((status = 200, description = "最近一次统计快照")))]
pub async fn xdp_stats(State(state): State<AppState>) -> ApiResult<XdpStats> {
    let snapshot = match state.steering.latest_snapshot().await {
        Some(snapshot) => Some(snapshot),
        None => state.steering.collect_stats().await,
    };
    ok(XdpStats {
        attached: state.steering.status().await.attached,
        snapshot,
    })
}

#[derive(Deserialize)]
pub struct HostRequest {
    pub ip: Option<String>,
}

#[derive(Serialize)]
pub struct HostResult {
    pub ip: Ipv4Addr,
    pub added: bool,
}

fn parse_host(raw: &str) -> Result<Ipv4Addr, ApiError> {
    raw.trim()
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("无效的 IPv4 地址: {}", raw)))
}

async fn list_hosts(state: &AppState, list: HostList) -> ApiResult<Vec<Ipv4Addr>> {
    ok(state.steering.list_hosts(list).await)
}

async fn add_host(
    state: &AppState,
    list: HostList,
    payload: Result<Json<HostRequest>, JsonRejection>,
) -> ApiResult<HostResult> {
    let request = json_body(payload)?;
    let raw = request
        .ip
        .ok_or_else(|| ApiError::BadRequest("缺少 ip 字段".to_string()))?;
    let ip = parse_host(&raw)?;
    let added = state.steering.add_host(list, ip).await?;
    ok(HostResult { ip, added })
}

async fn remove_host(state: &AppState, list: HostList, raw: &str) -> ApiResult<Ipv4Addr> {
    let ip = parse_host(raw)?;
    state.steering.remove_host(list, ip).await?;
    ok(ip)
}

#[utoipa::path(get, path = "/api/v1/xdp/allowlist", tag = "xdp", responses((status = 200, description = "白名单")))]
pub async fn list_allowlist(State(state): State<AppState>) -> ApiResult<Vec<Ipv4Addr>> {
    list_hosts(&state, HostList::Allow).await
}

#[utoipa::path(post, path = "/api/v1/xdp/allowlist", tag = "xdp", responses((status = 200, description = "已添加"), (status = 400, description = "ip 缺失或无效")))]
pub async fn add_allowlist(
    State(state): State<AppState>,
    payload: Result<Json<HostRequest>, JsonRejection>,
) -> ApiResult<HostResult> {
    add_host(&state, HostList::Allow, payload).await
}

#[utoipa::path(delete, path = "/api/v1/xdp/allowlist/{ip}", tag = "xdp", params(("ip" = String, Path, description = "IPv4 地址")), responses((status = 200, description = "已移除"), (status = 404, description = "地址不在名单中")))]
pub async fn remove_allowlist(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> ApiResult<Ipv4Addr> {
    remove_host(&state, HostList::Allow, &ip).await
}

#[utoipa::path(get, path = "/api/v1/xdp/denylist", tag = "xdp", responses((status = 200, description = "黑名单")))]
pub async fn list_denylist(State(state): State<AppState>) -> ApiResult<Vec<Ipv4Addr>> {
    list_hosts(&state, HostList::Deny).await
}

#[utoipa::path(post, path = "/api/v1/xdp/denylist", tag = "xdp", responses((status = 200, description = "已添加"), (status = 400, description = "ip 缺失或无效")))]
pub async fn add_denylist(
    State(state): State<AppState>,
    payload: Result<Json<HostRequest>, JsonRejection>,
) -> ApiResult<HostResult> {
    add_host(&state, HostList::Deny, payload).await
}

#[utoipa::path(delete, path = "/api/v1/xdp/denylist/{ip}", tag = "xdp", params(("ip" = String, Path, description = "IPv4 地址")), responses((status = 200, description = "已移除"), (status = 404, description = "地址不在名单中")))]
pub async fn remove_denylist(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> ApiResult<Ipv4Addr> {
    remove_host(&state, HostList::Deny, &ip).await
}

// === 路由 ===

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

async fn not_found() -> ApiError {
    ApiError::NotFound("接口不存在".to_string())
}

/// 路由层返回的空 405 改写成统一的 JSON 错误
async fn json_method_not_allowed(response: Response) -> Response {
    if response.status() != StatusCode::METHOD_NOT_ALLOWED {
        return response;
    }
    let allow = response.headers().get(header::ALLOW).cloned();
    let mut rewritten = ApiError::MethodNotAllowed.into_response();
    if let Some(allow) = allow {
        rewritten.headers_mut().insert(header::ALLOW, allow);
    }
    rewritten
}

// 创建 API 路由器
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // 健康检查与指标
        .route("/healthz", get(health_check))
        .route("/readyz", get(ready_check))
        .route("/metrics", get(metrics))
        // CA
        .route("/api/v1/ca", get(get_ca_info))
        .route("/api/v1/ca/download", get(download_ca))
        .route("/api/v1/ca/fingerprint", get(get_ca_fingerprint))
        .route("/api/v1/ca/regenerate", post(regenerate_ca))
        // 旁路域名
        .route("/api/v1/bypass", get(list_bypass).post(add_bypass))
        .route("/api/v1/bypass/:domain", axum::routing::delete(remove_bypass))
        // 设置与统计
        .route("/api/v1/settings", get(get_settings).put(update_settings))
        .route("/api/v1/stats", get(get_stats))
        .route("/api/v1/connections", get(list_connections))
        // XDP 分类器
        .route("/api/v1/xdp/status", get(xdp_status))
        .route("/api/v1/xdp/rules", get(list_rules).post(create_rule))
        .route(
            "/api/v1/xdp/rules/:id",
            get(get_rule).put(update_rule).delete(delete_rule),
        )
        .route("/api/v1/xdp/rules/reorder", post(reorder_rules))
        .route("/api/v1/xdp/rules/:id/toggle", post(toggle_rule))
        .route("/api/v1/xdp/stats", get(xdp_stats))
        .route("/api/v1/xdp/allowlist", get(list_allowlist).post(add_allowlist))
        .route("/api/v1/xdp/allowlist/:ip", axum::routing::delete(remove_allowlist))
        .route("/api/v1/xdp/denylist", get(list_denylist).post(add_denylist))
        .route("/api/v1/xdp/denylist/:ip", axum::routing::delete(remove_denylist))
        // OpenAPI 文档
        .route("/api-docs/openapi.json", get(openapi_json))
        .fallback(not_found)
        .layer(middleware::map_response(json_method_not_allowed))
        // 启用 CORS
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// 启动管理接口，收到停止信号后优雅退出
pub async fn start_web_server(
    state: AppState,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind management API on {}", addr))?;
    info!("管理接口启动在 {}", addr);
    info!("访问 http://{}/api/v1/stats 查看代理统计", addr);
    info!("访问 http://{}/api-docs/openapi.json 获取接口文档", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    Ok(())
}
