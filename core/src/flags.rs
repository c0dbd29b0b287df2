use env_flags::env_flags;

env_flags! {
    pub BB7_DEFAULT_MODEL: &str = "gpt-4.1-mini";
    pub BB7_API_BASE: &str = "https://api.openai.com/v1";

    /// Fallback when no key is configured in the config file.
    pub BB7_API_KEY: Option<&str> = None;
}
