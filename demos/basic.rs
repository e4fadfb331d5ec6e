use std::time::Duration;

use serde::{Deserialize, Serialize};
use taskmill::{BackoffPolicy, JobOptions, QueueConfig, TaskQueue};

#[derive(Debug, Serialize, Deserialize)]
struct SendEmailArgs {
    to: String,
    subject: String,
}

async fn send_email(args: SendEmailArgs) -> Result<(), String> {
    println!("sending email to {}: {}", args.to, args.subject);
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct ProcessPaymentArgs {
    order_id: String,
    amount: f64,
}

async fn process_payment(args: ProcessPaymentArgs) -> Result<(), String> {
    println!("processing ${} for order {}", args.amount, args.order_id);
    if args.amount > 1000.0 {
        return Err("requires manual review".to_string());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut queue = TaskQueue::open("sqlite://jobs.db?mode=rwc", QueueConfig::default()).await?;

    let send_email_job = queue.register("send_email", send_email, JobOptions::default());
    let cleanup_job = queue.register(
        "cleanup",
        |_: ()| async {
            println!("running cleanup");
            Ok::<(), String>(())
        },
        JobOptions::default(),
    );
    let payment_job = queue.register(
        "process_payment",
        process_payment,
        JobOptions::default()
            .with_max_attempts(5)
            .with_backoff(BackoffPolicy::Exponential {
                base: Duration::from_secs(2),
                cap: Duration::from_secs(120),
                jitter: Some(Duration::from_millis(500)),
            })
            .with_timeout(Duration::from_secs(30)),
    );

    queue.start().await?;

    // Fire-and-forget
    send_email_job
        .enqueue(SendEmailArgs {
            to: "user@example.com".to_string(),
            subject: "Welcome!".to_string(),
        })
        .await?;

    // Delayed job
    send_email_job
        .enqueue_delayed(
            SendEmailArgs {
                to: "user@example.com".to_string(),
                subject: "Reminder".to_string(),
            },
            Duration::from_secs(60),
        )
        .await?;

    // One payment per order, no matter how often the caller retries
    payment_job
        .enqueue_keyed(
            ProcessPaymentArgs {
                order_id: "order-1001".to_string(),
                amount: 49.99,
            },
            "payment:order-1001",
        )
        .await?;

    // Nightly cleanup at 03:00
    cleanup_job.enqueue_recurring("0 0 3 * * *", ()).await?;

    queue.wait_for_shutdown().await;
    Ok(())
}
