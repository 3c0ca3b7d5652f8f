// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use clap::{Parser, Subcommand};
use csv::Writer;
use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use transfer_engine::logging::init_logging;
use transfer_engine::{
    Amount, AppConfig, ConcurrencyHarness, DecliningGateway, OrderProcessor, OrderSaga,
    PaymentGateway, SimulatedGateway, StockService, Store, TransactionLedger, TransferEngine,
};

/// Transfer Engine - exercise the transfer, stock and order workflows
///
/// Runs one scenario against a fresh in-memory store and reports the outcome
/// on stderr. With `--history`, the transfer ledger is written to stdout as CSV.
#[derive(Parser, Debug)]
#[command(name = "transfer-engine")]
#[command(about = "Concurrent transfer and inventory engine scenarios", long_about = None)]
struct Args {
    /// Path to a YAML config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Write the transaction ledger to stdout as CSV when done
    #[arg(long)]
    history: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run concurrent random transfers between two accounts and check
    /// that the total balance is conserved
    Transfers {
        #[arg(short, long, default_value_t = 50)]
        workers: usize,
    },
    /// Lock two accounts in opposite order from two threads
    Deadlock {
        /// Pause between the first and second lock
        #[arg(long, default_value_t = 100)]
        delay_ms: u64,
    },
    /// Place one order and run it through the saga
    Saga {
        /// Decline the payment to exercise compensation
        #[arg(long)]
        fail_payment: bool,
        #[arg(long, default_value_t = 2)]
        quantity: u32,
        /// Process the order in one unit of work instead of the saga
        #[arg(long)]
        single_transaction: bool,
    },
}

fn main() {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match AppConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading config: {}", e);
                process::exit(1);
            }
        },
        None => AppConfig::default(),
    };
    init_logging(&config.log);

    let store = Arc::new(Store::new(config.store.to_store_config()));
    let ok = match args.command {
        Command::Transfers { workers } => run_transfers(&store, &config, workers),
        Command::Deadlock { delay_ms } => {
            run_deadlock(&store, &config, Duration::from_millis(delay_ms))
        }
        Command::Saga {
            fail_payment,
            quantity,
            single_transaction,
        } => run_saga(&store, &config, fail_payment, quantity, single_transaction),
    };

    if args.history {
        if let Err(e) = write_history(store.ledger(), std::io::stdout()) {
            eprintln!("Error writing history: {}", e);
            process::exit(1);
        }
    }
    if !ok {
        process::exit(1);
    }
}

fn harness(store: &Arc<Store>, config: &AppConfig) -> ConcurrencyHarness {
    let engine = TransferEngine::with_default_timeout(
        Arc::clone(store),
        config.transfer.default_timeout(),
    );
    ConcurrencyHarness::new(engine, config.harness.to_harness_config())
}

fn run_transfers(store: &Arc<Store>, config: &AppConfig, workers: usize) -> bool {
    let harness = harness(store, config);
    match harness.concurrent_transfers(workers) {
        Ok(report) => {
            eprintln!(
                "workers={} success={} failed={} timeout={} initial={} final={} elapsed={:?}",
                report.workers,
                report.successes,
                report.failures,
                report.timeouts,
                report.initial_total,
                report.final_total,
                report.elapsed
            );
            if !report.is_conserved() {
                eprintln!("Conservation violated");
            }
            report.is_conserved()
        }
        Err(e) => {
            eprintln!("Error running transfers: {}", e);
            false
        }
    }
}

fn run_deadlock(store: &Arc<Store>, config: &AppConfig, delay: Duration) -> bool {
    let harness = harness(store, config);
    match harness.deadlock(delay) {
        Ok(report) => {
            for outcome in &report.outcomes {
                match &outcome.result {
                    Ok(()) => eprintln!("{} -> {}: committed", outcome.first, outcome.second),
                    Err(e) => eprintln!("{} -> {}: {}", outcome.first, outcome.second, e),
                }
            }
            eprintln!(
                "error surfaced={} before={} after={}",
                report.error_surfaced(),
                report.total_before,
                report.total_after
            );
            report.is_conserved()
        }
        Err(e) => {
            eprintln!("Error running deadlock scenario: {}", e);
            false
        }
    }
}

fn run_saga(
    store: &Arc<Store>,
    config: &AppConfig,
    fail_payment: bool,
    quantity: u32,
    single_transaction: bool,
) -> bool {
    let gateway: Arc<dyn PaymentGateway> = if fail_payment {
        Arc::new(DecliningGateway::new("card declined"))
    } else {
        Arc::new(SimulatedGateway)
    };
    let stock = StockService::with_policy(Arc::clone(store), config.stock.to_retry_policy());
    let product = match stock.add_product("Widget", "WID-001", Amount::from_minor(1_999), 10) {
        Ok(product) => product,
        Err(e) => {
            eprintln!("Error creating product: {}", e);
            return false;
        }
    };

    let items = [(product.id, quantity)];
    let (order, outcome) = if single_transaction {
        let processor = OrderProcessor::new(Arc::clone(store), gateway)
            .with_timeout(config.order.checkout_timeout());
        match processor.place_order(1, &items) {
            Ok(order) => {
                let outcome = processor.process_order(order.id);
                (order, outcome)
            }
            Err(e) => {
                eprintln!("Error placing order: {}", e);
                return false;
            }
        }
    } else {
        let saga = OrderSaga::with_step_timeout(
            Arc::clone(store),
            gateway,
            config.order.saga_step_timeout(),
        );
        match saga.place_order(1, &items) {
            Ok(order) => {
                let outcome = saga.process_order_saga(order.id);
                (order, outcome)
            }
            Err(e) => {
                eprintln!("Error placing order: {}", e);
                return false;
            }
        }
    };
    let after = store.order(order.id);
    let product = store.product(product.id);
    match &outcome {
        Ok(order) => eprintln!("order {} {:?}", order.order_number, order.status),
        Err(e) => eprintln!("order {} failed: {}", order.order_number, e),
    }
    if let (Some(after), Some(product)) = (after, product) {
        eprintln!(
            "status={:?} stock={} reserved={}",
            after.status, product.stock, product.reserved
        );
    }
    // A declined payment is the expected outcome of --fail-payment.
    outcome.is_ok() || fail_payment
}

/// Writes every ledger entry, oldest first, as CSV.
///
/// # Errors
///
/// Returns a CSV error if writing fails.
fn write_history<W: Write>(ledger: &TransactionLedger, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    for record in ledger.history(None) {
        wtr.serialize(&record)?;
    }
    wtr.flush()?;
    Ok(())
}
