// Copyright 2025 The dcSCTP Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::api::Options;
use std::time::Duration;

/// RTO.Alpha and RTO.Beta of RFC 9260 §15.
const SRTT_GAIN: f64 = 1.0 / 8.0;
const RTTVAR_GAIN: f64 = 1.0 / 4.0;

/// The variance is multiplied by K (4) when computing the RTO.
const VARIANCE_MULTIPLIER: f64 = 4.0;

/// [`Options::min_rtt_variance`] is divided by this factor before it's used as a lower bound for
/// the variance. Existing deployments have tuned their configured value with this factor applied.
const MIN_RTT_VARIANCE_DIVISOR: f64 = 8.0;

#[derive(Clone, Copy)]
enum Estimate {
    /// No RTT has been measured yet.
    Initial { srtt: f64 },
    Measured { srtt: f64, rttvar: f64 },
}

/// Computes the retransmission timeout from RTT measurements, as described in
/// <https://datatracker.ietf.org/doc/html/rfc9260#section-6.3.1>.
pub struct RetransmissionTimeout {
    rto_bounds: (f64, f64),
    rtt_max: Duration,
    min_rttvar: f64,
    estimate: Estimate,
    rto: Duration,
}

impl RetransmissionTimeout {
    pub fn new(options: &Options) -> Self {
        Self {
            rto_bounds: (options.rto_min.as_secs_f64(), options.rto_max.as_secs_f64()),
            rtt_max: options.rtt_max,
            min_rttvar: options.min_rtt_variance.as_secs_f64() / MIN_RTT_VARIANCE_DIVISOR,
            estimate: Estimate::Initial { srtt: options.rto_initial.as_secs_f64() },
            rto: options.rto_initial,
        }
    }

    /// The current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// The smoothed round-trip time, or the initial RTO if nothing has been measured.
    pub fn srtt(&self) -> Duration {
        match self.estimate {
            Estimate::Initial { srtt } | Estimate::Measured { srtt, .. } => {
                Duration::from_secs_f64(srtt)
            }
        }
    }

    /// Updates the RTO with a new RTT measurement. Measurements above [`Options::rtt_max`] are
    /// ignored, as a single corrupt value could take a long time to recover from.
    pub fn observe_rtt(&mut self, measured_rtt: Duration) {
        if measured_rtt > self.rtt_max {
            return;
        }
        let r = measured_rtt.as_secs_f64();

        let (srtt, rttvar) = match self.estimate {
            Estimate::Initial { .. } => (r, r / 2.0),
            Estimate::Measured { srtt, rttvar } => {
                let rttvar = (1.0 - RTTVAR_GAIN) * rttvar + RTTVAR_GAIN * (srtt - r).abs();
                ((1.0 - SRTT_GAIN) * srtt + SRTT_GAIN * r, rttvar)
            }
        };
        let rttvar = rttvar.max(self.min_rttvar);
        self.estimate = Estimate::Measured { srtt, rttvar };

        let (min_rto, max_rto) = self.rto_bounds;
        let rto = (srtt + VARIANCE_MULTIPLIER * rttvar).clamp(min_rto, max_rto);
        self.rto = Duration::from_secs_f64(rto);
    }
}
