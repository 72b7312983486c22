use clap::{Arg, Command};

pub fn with_args(command: Command) -> Command {
    let command = with_url_args(command);
    let command = with_token_args(command);
    let command = with_lockout_args(command);
    let command = with_totp_args(command);
    with_federated_args(command)
}

fn with_url_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("frontend-base-url")
                .long("frontend-base-url")
                .help("Frontend base URL used for activation links, redirects, and CORS")
                .env("CUSTODIA_FRONTEND_BASE_URL")
                .default_value("http://localhost:3000"),
        )
        .arg(
            Arg::new("api-base-url")
                .long("api-base-url")
                .help("Public base URL of this API, used to build OAuth redirect URIs")
                .env("CUSTODIA_API_BASE_URL")
                .default_value("http://localhost:8080"),
        )
}

fn with_token_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("token-secret")
                .long("token-secret")
                .help("HMAC secret for signing access, activation, and state tokens")
                .env("CUSTODIA_TOKEN_SECRET")
                .required(true),
        )
        .arg(
            Arg::new("token-issuer")
                .long("token-issuer")
                .help("Issuer claim stamped into signed tokens")
                .env("CUSTODIA_TOKEN_ISSUER")
                .default_value("custodia"),
        )
        .arg(
            Arg::new("backup-code-pepper")
                .long("backup-code-pepper")
                .help("Server-side pepper mixed into backup code hashes")
                .env("CUSTODIA_BACKUP_CODE_PEPPER")
                .required(true),
        )
        .arg(
            Arg::new("access-token-ttl-seconds")
                .long("access-token-ttl-seconds")
                .help("Access token TTL in seconds")
                .env("CUSTODIA_ACCESS_TOKEN_TTL_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("refresh-token-ttl-seconds")
                .long("refresh-token-ttl-seconds")
                .help("Refresh token TTL in seconds")
                .env("CUSTODIA_REFRESH_TOKEN_TTL_SECONDS")
                .default_value("604800")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("activation-token-ttl-seconds")
                .long("activation-token-ttl-seconds")
                .help("Account activation token TTL in seconds")
                .env("CUSTODIA_ACTIVATION_TOKEN_TTL_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("reset-code-ttl-seconds")
                .long("reset-code-ttl-seconds")
                .help("Password reset code TTL in seconds")
                .env("CUSTODIA_RESET_CODE_TTL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("security-code-ttl-seconds")
                .long("security-code-ttl-seconds")
                .help("Step-up security code TTL in seconds")
                .env("CUSTODIA_SECURITY_CODE_TTL_SECONDS")
                .default_value("600")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("state-token-ttl-seconds")
                .long("state-token-ttl-seconds")
                .help("Federated login state token TTL in seconds")
                .env("CUSTODIA_STATE_TOKEN_TTL_SECONDS")
                .default_value("600")
                .value_parser(clap::value_parser!(i64)),
        )
}

fn with_lockout_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("failed-login-limit")
                .long("failed-login-limit")
                .help("Consecutive failed password attempts before lockout")
                .env("CUSTODIA_FAILED_LOGIN_LIMIT")
                .default_value("5")
                .value_parser(clap::value_parser!(i32)),
        )
        .arg(
            Arg::new("lockout-seconds")
                .long("lockout-seconds")
                .help("Account lockout duration in seconds")
                .env("CUSTODIA_LOCKOUT_SECONDS")
                .default_value("1800")
                .value_parser(clap::value_parser!(i64)),
        )
}

fn with_totp_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("totp-issuer")
                .long("totp-issuer")
                .help("Issuer shown in authenticator apps for TOTP enrollments")
                .env("CUSTODIA_TOTP_ISSUER")
                .default_value("Custodia"),
        )
        .arg(
            Arg::new("pending-totp-ttl-seconds")
                .long("pending-totp-ttl-seconds")
                .help("TTL for unconfirmed TOTP enrollments in seconds")
                .env("CUSTODIA_PENDING_TOTP_TTL_SECONDS")
                .default_value("600")
                .value_parser(clap::value_parser!(i64)),
        )
}

fn with_federated_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("google-client-id")
                .long("google-client-id")
                .help("Google OAuth client ID; omit to disable Google login")
                .env("CUSTODIA_GOOGLE_CLIENT_ID"),
        )
        .arg(
            Arg::new("google-client-secret")
                .long("google-client-secret")
                .help("Google OAuth client secret")
                .env("CUSTODIA_GOOGLE_CLIENT_SECRET")
                .requires("google-client-id"),
        )
        .arg(
            Arg::new("github-client-id")
                .long("github-client-id")
                .help("GitHub OAuth client ID; omit to disable GitHub login")
                .env("CUSTODIA_GITHUB_CLIENT_ID"),
        )
        .arg(
            Arg::new("github-client-secret")
                .long("github-client-secret")
                .help("GitHub OAuth client secret")
                .env("CUSTODIA_GITHUB_CLIENT_SECRET")
                .requires("github-client-id"),
        )
}
