//! Plain-text training telemetry

use std::time::Instant;

/// Logs step metrics to stdout with wall-clock throughput.
pub struct MetricsLogger {
    started: Instant,
    tokens_seen: u64,
}

impl MetricsLogger {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            tokens_seen: 0,
        }
    }

    pub fn record_tokens(&mut self, count: u64) {
        self.tokens_seen += count;
    }

    pub fn log_step(&self, epoch: u64, step: u64, loss: f32, lr: f32, grad_norm: f32) {
        let elapsed = self.started.elapsed().as_secs_f64().max(1e-9);
        let tok_per_sec = self.tokens_seen as f64 / elapsed;
        println!(
            "epoch {:3} | step {:6} | loss {:8.4} | lr {:.3e} | grad_norm {:7.3} | {:8.0} tok/s",
            epoch, step, loss, lr, grad_norm, tok_per_sec
        );
    }

    pub fn log_epoch(&self, epoch: u64, mean_loss: f32) {
        println!(
            "epoch {:3} done | mean loss {:8.4} | elapsed {:.1}s",
            epoch,
            mean_loss,
            self.started.elapsed().as_secs_f64()
        );
    }
}

impl Default for MetricsLogger {
    fn default() -> Self {
        Self::new()
    }
}
