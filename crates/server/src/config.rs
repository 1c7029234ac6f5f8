use std::env;

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub media_path: String,
    pub media_url: String,
    pub jwt_secret: String,
    pub token_ttl_days: i64,
    pub page_size: u32,
    pub max_image_bytes: usize,
    pub max_request_bytes: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: parsed("PORT", 3000),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./data/chantiers.db?mode=rwc".to_string()),
            media_path: env::var("MEDIA_PATH").unwrap_or_else(|_| "./data/media".to_string()),
            media_url: env::var("MEDIA_URL").unwrap_or_else(|_| "/media".to_string()),
            jwt_secret: env::var("JWT_SECRET")
                .unwrap_or_else(|_| "development-secret-change-in-production".to_string()),
            token_ttl_days: parsed("TOKEN_TTL_DAYS", 7),
            page_size: parsed("PAGE_SIZE", 20),
            max_image_bytes: parsed("MAX_IMAGE_BYTES", 5 * 1024 * 1024),
            max_request_bytes: parsed("MAX_REQUEST_BYTES", 20 * 1024 * 1024),
        }
    }
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
