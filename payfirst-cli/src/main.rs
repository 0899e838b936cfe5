use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use payfirst_core::{
    FlagStatus, GradualRollout, HealthSummary, ManualCompletion, PendingStats, PendingWork, RolloutFlag,
    SweepReport, PAYMENT_FIRST_FLOW,
};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

/// payfirst: operator tool for the payment-first registration pipeline
#[derive(Parser, Debug)]
#[command(name = "payfirst")]
#[command(about = "Operator tool for the payment-first registration pipeline", long_about = None)]
struct Cli {
    /// Base URL of the payfirst server
    #[arg(long, env = "PAYFIRST_URL", default_value = "http://localhost:3000", global = true)]
    url: String,

    /// Operator bearer token
    #[arg(long, env = "PAYFIRST_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Set the rollout percentage of a flag
    SetRollout(SetRolloutArgs),
    /// Force a flag to 0% and alert operators
    Rollback(RollbackArgs),
    /// Enable a flag
    Enable(FlagChangeArgs),
    /// Disable a flag
    Disable(FlagChangeArgs),
    /// Raise a flag's percentage by one step, refused while unhealthy
    Advance(AdvanceArgs),
    /// Step a flag towards a target on a timer, halting if it turns unhealthy
    Schedule(ScheduleArgs),
    /// Stop a scheduled gradual rollout
    CancelSchedule(FlagArgs),
    /// Replace the groups that always get the new flow (none clears them)
    SetGroups(SetGroupsArgs),
    /// Show the health window of a flag
    Health(FlagArgs),
    /// Show a flag and its change history
    Flag(FlagArgs),
    /// Retry a failed pending record now
    Complete(CompleteArgs),
    /// List failed pending records
    ListFailed(ListFailedArgs),
    /// Show pending-work counters
    Stats,
    /// Run one reconciliation sweep now
    Sweep,
}

#[derive(Args, Debug)]
struct FlagArgs {
    /// Flag name
    #[arg(long, default_value = PAYMENT_FIRST_FLOW)]
    flag: String,
}

#[derive(Args, Debug)]
struct FlagChangeArgs {
    #[command(flatten)]
    flag: FlagArgs,

    /// Recorded in the flag's audit history
    #[arg(long, env = "USER")]
    changed_by: Option<String>,
}

#[derive(Args, Debug)]
struct SetRolloutArgs {
    /// New percentage, 0 to 100
    percentage: u32,

    #[command(flatten)]
    change: FlagChangeArgs,
}

#[derive(Args, Debug)]
struct RollbackArgs {
    /// Why the rollback is happening
    #[arg(long)]
    reason: String,

    #[command(flatten)]
    change: FlagChangeArgs,
}

#[derive(Args, Debug)]
struct AdvanceArgs {
    /// Percentage to stop at
    #[arg(long, default_value_t = 100)]
    target: u32,

    /// Percentage points to add
    #[arg(long, default_value_t = 10)]
    step: u32,

    #[command(flatten)]
    change: FlagChangeArgs,
}

#[derive(Args, Debug)]
struct ScheduleArgs {
    #[command(flatten)]
    advance: AdvanceArgs,

    /// Minutes between steps
    #[arg(long, default_value_t = 60)]
    interval_mins: u64,
}

#[derive(Args, Debug)]
struct SetGroupsArgs {
    /// Group names
    groups: Vec<String>,

    #[command(flatten)]
    change: FlagChangeArgs,
}

#[derive(Args, Debug)]
struct CompleteArgs {
    /// Pending record id
    id: String,
}

#[derive(Args, Debug)]
struct ListFailedArgs {
    /// Only records of this kind
    #[arg(long, value_parser = ["awaiting_account_creation", "awaiting_subscription_link"])]
    kind: Option<String>,
}

struct OperatorClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl OperatorClient {
    fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method.clone(), &url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("{} {} failed with {}: {}", method, path, status, text));
        }
        response
            .json::<T>()
            .await
            .with_context(|| format!("Failed to parse response from {}", path))
    }
}

fn flag_path(flag: &str, suffix: &str) -> String {
    format!("/flags/{}{}", flag, suffix)
}

fn print_flag(flag: &RolloutFlag) {
    println!(
        "{}: {} at {}%",
        flag.name,
        if flag.enabled { "enabled" } else { "disabled" },
        flag.rollout_percentage
    );
    if !flag.target_groups.is_empty() {
        println!("Target groups: {}", flag.target_groups.join(", "));
    }
}

fn print_schedule(plan: Option<&GradualRollout>) {
    match plan {
        Some(plan) => println!(
            "Gradual rollout: +{}% every {}s up to {}%, next step at {}",
            plan.step,
            plan.interval_secs,
            plan.target,
            plan.next_step_at.to_rfc3339()
        ),
        None => println!("Gradual rollout: none scheduled"),
    }
}

fn print_health(health: &HealthSummary) {
    println!(
        "{} over the last {}s: {} outcomes, {:.2}% success, {:.2}% errors, {:.0} ms average",
        if health.is_healthy { "healthy" } else { "UNHEALTHY" },
        health.window_secs,
        health.attempts,
        health.success_rate,
        health.error_rate,
        health.avg_processing_ms
    );
}

fn print_pending(work: &PendingWork) {
    println!(
        "{}  {}  payment={}  email={}  attempts={}  error={}",
        work.id,
        work.kind,
        work.payment_id,
        work.user_payload.email,
        work.attempts,
        work.last_error.as_deref().unwrap_or("-")
    );
}

async fn run(client: &OperatorClient, command: Commands) -> Result<()> {
    match command {
        Commands::SetRollout(args) => {
            let flag: RolloutFlag = client
                .send(
                    Method::PUT,
                    &flag_path(&args.change.flag.flag, "/percentage"),
                    Some(json!({
                        "percentage": args.percentage,
                        "changed_by": args.change.changed_by,
                    })),
                )
                .await?;
            print_flag(&flag);
        }
        Commands::Rollback(args) => {
            let response: Value = client
                .send(
                    Method::POST,
                    &flag_path(&args.change.flag.flag, "/rollback"),
                    Some(json!({
                        "reason": args.reason,
                        "changed_by": args.change.changed_by,
                    })),
                )
                .await?;
            if response["rolled_back"].as_bool().unwrap_or(false) {
                println!("Rolled back {} to 0%", args.change.flag.flag);
            } else {
                println!("{} was already at 0%; nothing to do", args.change.flag.flag);
            }
        }
        Commands::Enable(args) => set_enabled(client, args, true).await?,
        Commands::Disable(args) => set_enabled(client, args, false).await?,
        Commands::Advance(args) => {
            let flag: RolloutFlag = client
                .send(
                    Method::POST,
                    &flag_path(&args.change.flag.flag, "/advance"),
                    Some(json!({
                        "target": args.target,
                        "step": args.step,
                        "changed_by": args.change.changed_by,
                    })),
                )
                .await?;
            print_flag(&flag);
        }
        Commands::Schedule(args) => {
            let interval_secs = args
                .interval_mins
                .checked_mul(60)
                .ok_or_else(|| anyhow!("Interval of {} minutes is too long", args.interval_mins))?;
            let status: FlagStatus = client
                .send(
                    Method::POST,
                    &flag_path(&args.advance.change.flag.flag, "/gradual"),
                    Some(json!({
                        "target": args.advance.target,
                        "step": args.advance.step,
                        "interval_secs": interval_secs,
                        "changed_by": args.advance.change.changed_by,
                    })),
                )
                .await?;
            print_flag(&status.flag);
            print_schedule(status.gradual_rollout.as_ref());
        }
        Commands::CancelSchedule(args) => {
            let response: Value = client
                .send(Method::DELETE, &flag_path(&args.flag, "/gradual"), None)
                .await?;
            if response["cancelled"].is_null() {
                println!("{} had no gradual rollout scheduled", args.flag);
            } else {
                println!("Cancelled the gradual rollout of {}", args.flag);
            }
        }
        Commands::SetGroups(args) => {
            let flag: RolloutFlag = client
                .send(
                    Method::PUT,
                    &flag_path(&args.change.flag.flag, "/target-groups"),
                    Some(json!({
                        "groups": args.groups,
                        "changed_by": args.change.changed_by,
                    })),
                )
                .await?;
            print_flag(&flag);
        }
        Commands::Health(args) => {
            let health: HealthSummary = client
                .send(Method::GET, &flag_path(&args.flag, "/health"), None)
                .await?;
            print_health(&health);
        }
        Commands::Flag(args) => {
            let status: FlagStatus = client
                .send(Method::GET, &flag_path(&args.flag, ""), None)
                .await?;
            print_flag(&status.flag);
            print_health(&status.health);
            println!("Unhealthy streak: {}", status.unhealthy_streak);
            print_schedule(status.gradual_rollout.as_ref());
            println!("History:");
            for change in &status.flag.history {
                println!(
                    "  {}  {:<20} {:>3}% -> {:>3}%  by {}{}",
                    change.at.to_rfc3339(),
                    change.action.as_str(),
                    change.old_percentage,
                    change.new_percentage,
                    change.changed_by.as_deref().unwrap_or("-"),
                    change
                        .reason
                        .as_deref()
                        .map(|r| format!("  ({r})"))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Complete(args) => {
            let result: ManualCompletion = client
                .send(Method::POST, &format!("/pending/{}/complete", args.id), None)
                .await?;
            if result.success {
                println!(
                    "{} completed (account {})",
                    result.id,
                    result.account_id.as_deref().unwrap_or("-")
                );
            } else {
                println!(
                    "{} is still {}: {}",
                    result.id,
                    result.status,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Commands::ListFailed(args) => {
            let path = match &args.kind {
                Some(kind) => format!("/pending/failed?kind={}", kind),
                None => "/pending/failed".to_string(),
            };
            let failed: Vec<PendingWork> = client.send(Method::GET, &path, None).await?;
            if failed.is_empty() {
                println!("No failed records");
            }
            for work in &failed {
                print_pending(work);
            }
        }
        Commands::Stats => {
            let stats: PendingStats = client.send(Method::GET, "/pending/stats", None).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Sweep => {
            let report: SweepReport = client.send(Method::POST, "/sweep", None).await?;
            println!("{}", report.message());
            for error in &report.errors {
                println!("  {}", error);
            }
            if report.abandoned > 0 {
                println!("{} records left for the next sweep", report.abandoned);
            }
        }
    }
    Ok(())
}

async fn set_enabled(client: &OperatorClient, args: FlagChangeArgs, enabled: bool) -> Result<()> {
    let flag: RolloutFlag = client
        .send(
            Method::PUT,
            &flag_path(&args.flag.flag, "/enabled"),
            Some(json!({
                "enabled": enabled,
                "changed_by": args.changed_by,
            })),
        )
        .await?;
    print_flag(&flag);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = OperatorClient::new(&cli.url, cli.token)?;
    run(&client, cli.command).await
}
