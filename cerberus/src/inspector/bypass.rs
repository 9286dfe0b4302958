use std::collections::HashSet;
use tokio::sync::RwLock;

/// 不做解密、直接透传的域名集合
#[derive(Debug, Default)]
pub struct BypassMatcher {
    domains: RwLock<HashSet<String>>,
}

/// 去掉首尾空白和结尾的点，转小写
pub fn normalize(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

impl BypassMatcher {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .map(|d| normalize(d.as_ref()))
            .filter(|d| !d.is_empty())
            .collect();
        Self {
            domains: RwLock::new(domains),
        }
    }

    /// 添加域名，返回是否为新条目；空域名返回 None
    pub async fn add(&self, domain: &str) -> Option<bool> {
        let domain = normalize(domain);
        if domain.is_empty() {
            return None;
        }
        Some(self.domains.write().await.insert(domain))
    }

    pub async fn remove(&self, domain: &str) -> bool {
        self.domains.write().await.remove(&normalize(domain))
    }

    /// 排序后的列表
    pub async fn list(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.domains.read().await.iter().cloned().collect();
        domains.sort();
        domains
    }

    /// 先精确匹配，再逐级检查父域名
    pub async fn matches(&self, host: &str) -> bool {
        let host = normalize(host);
        if host.is_empty() {
            return false;
        }
        let domains = self.domains.read().await;
        if domains.contains(&host) {
            return true;
        }
        let mut rest = host.as_str();
        while let Some((_, parent)) = rest.split_once('.') {
            if domains.contains(parent) {
                return true;
            }
            rest = parent;
        }
        false
    }
}
