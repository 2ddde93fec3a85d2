use chrono_tz::Tz;
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use crate::summarizer::SummaryOptions;

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub source_feed_url: String,
    pub openai_api_base: Option<String>,
    pub openai_api_key: String,
    pub openai_model: String,
    pub summary_max_tokens: u32,
    pub summary_temperature: f32,
    pub summary_timeout_secs: u64,
    pub summary_max_input_chars: usize,
    pub scheduler_timezone: Tz,
    pub dump_hour: u32,
    pub dump_minute: u32,
    pub push_offset_minutes: u32,
    pub fetch_timeout_secs: u64,
    pub fetch_limit: usize,
    pub webhook_url: Option<String>,
    pub backfill_days: i64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        let scheduler_timezone: Tz = env::var("SCHEDULER_TIMEZONE")
            .unwrap_or_else(|_| "Europe/Moscow".to_string())
            .parse()
            .map_err(|_| anyhow::anyhow!("SCHEDULER_TIMEZONE must be a valid IANA zone"))?;

        let dump_hour: u32 = env::var("DUMP_HOUR")
            .unwrap_or_else(|_| "15".to_string())
            .parse()
            .unwrap_or(15);
        let dump_minute: u32 = env::var("DUMP_MINUTE")
            .unwrap_or_else(|_| "0".to_string())
            .parse()
            .unwrap_or(0);
        if dump_hour > 23 || dump_minute > 59 {
            anyhow::bail!("DUMP_HOUR/DUMP_MINUTE out of range");
        }

        Ok(Config {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "data/daybrief.db".to_string()),
            source_feed_url: env::var("SOURCE_FEED_URL")
                .map_err(|_| anyhow::anyhow!("SOURCE_FEED_URL must be set"))?,
            openai_api_base: env::var("OPENAI_API_BASE").ok(),
            openai_api_key: env::var("OPENAI_API_KEY")
                .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY must be set"))?,
            openai_model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            summary_max_tokens: env::var("SUMMARY_MAX_TOKENS")
                .unwrap_or_else(|_| "500".to_string())
                .parse()
                .unwrap_or(500),
            summary_temperature: env::var("SUMMARY_TEMPERATURE")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .unwrap_or(0.0),
            summary_timeout_secs: env::var("SUMMARY_TIMEOUT_SECS")
                .unwrap_or_else(|_| "120".to_string())
                .parse()
                .unwrap_or(120),
            summary_max_input_chars: env::var("SUMMARY_MAX_INPUT_CHARS")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()
                .unwrap_or(8000),
            scheduler_timezone,
            dump_hour,
            dump_minute,
            push_offset_minutes: env::var("PUSH_OFFSET_MINUTES")
                .unwrap_or_else(|_| "7".to_string())
                .parse()
                .unwrap_or(7),
            fetch_timeout_secs: env::var("FETCH_TIMEOUT_SECS")
                .unwrap_or_else(|_| "15".to_string())
                .parse()
                .unwrap_or(15),
            fetch_limit: env::var("FETCH_LIMIT")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .unwrap_or(1000),
            webhook_url: env::var("WEBHOOK_URL").ok(),
            backfill_days: env::var("BACKFILL_DAYS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
        })
    }

    pub fn summary_options(&self) -> SummaryOptions {
        SummaryOptions {
            model: self.openai_model.clone(),
            max_tokens: self.summary_max_tokens,
            temperature: self.summary_temperature,
            timeout: Duration::from_secs(self.summary_timeout_secs),
            max_input_chars: self.summary_max_input_chars,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &self.database_url)
            .field("source_feed_url", &self.source_feed_url)
            .field("openai_api_base", &self.openai_api_base)
            .field("openai_api_key", &"[REDACTED]")
            .field("openai_model", &self.openai_model)
            .field("summary_max_tokens", &self.summary_max_tokens)
            .field("summary_temperature", &self.summary_temperature)
            .field("summary_timeout_secs", &self.summary_timeout_secs)
            .field("summary_max_input_chars", &self.summary_max_input_chars)
            .field("scheduler_timezone", &self.scheduler_timezone)
            .field("dump_hour", &self.dump_hour)
            .field("dump_minute", &self.dump_minute)
            .field("push_offset_minutes", &self.push_offset_minutes)
            .field("fetch_timeout_secs", &self.fetch_timeout_secs)
            .field("fetch_limit", &self.fetch_limit)
            .field("webhook_url", &self.webhook_url)
            .field("backfill_days", &self.backfill_days)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_config_logic() {
        // 1. Missing required vars
        env::remove_var("SOURCE_FEED_URL");
        env::remove_var("OPENAI_API_KEY");
        let result = Config::build();
        assert!(result.is_err(), "Should fail when required vars are missing");

        // 2. Defaults
        env::set_var("SOURCE_FEED_URL", "http://localhost:9000/feed");
        env::set_var("OPENAI_API_KEY", "secret_api_key");
        let config = Config::build().unwrap();
        assert_eq!(config.scheduler_timezone, chrono_tz::Europe::Moscow);
        assert_eq!(config.dump_hour, 15);
        assert_eq!(config.push_offset_minutes, 7);
        assert_eq!(config.summary_options().max_tokens, 500);

        // 3. Invalid timezone rejected
        env::set_var("SCHEDULER_TIMEZONE", "Mars/Olympus_Mons");
        assert!(Config::build().is_err());
        env::remove_var("SCHEDULER_TIMEZONE");

        // 4. Debug redaction
        let debug_output = format!("{:?}", config);
        assert!(!debug_output.contains("secret_api_key"));
        assert!(debug_output.contains("[REDACTED]"));

        // Cleanup
        env::remove_var("SOURCE_FEED_URL");
        env::remove_var("OPENAI_API_KEY");
    }
}
