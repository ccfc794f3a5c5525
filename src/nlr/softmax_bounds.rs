//! Closed-form linear envelopes for softmax outputs over an input box.
//!
//! Two decompositions are supported: log-sum-exp (LSE, with an anchored LSE2
//! variant used once an output's lower bound is large enough) and
//! exponential-reciprocal (ER). Lower envelopes are tangent at the box
//! center; upper envelopes interpolate between the output bounds.

use crate::constraints::softmax::{log_sum_of_exponential, sum_of_exponential, x_tilda};

/// Value of the LSE lower envelope for output `i` at the point `inputs`.
pub fn lse_lower_bound(inputs: &[f64], input_lbs: &[f64], input_ubs: &[f64], i: usize) -> f64 {
    let mut sum = 0.0;
    for j in 0..inputs.len() {
        let lj = input_lbs[j];
        let uj = input_ubs[j];
        let xj = inputs[j];
        sum += (uj - xj) / (uj - lj) * lj.exp() + (xj - lj) / (uj - lj) * uj.exp();
    }
    inputs[i].exp() / sum
}

/// Partial derivative of the LSE lower envelope with respect to input `di`,
/// evaluated at the box midpoints.
pub fn d_lse_lower_bound(
    input_mids: &[f64],
    input_lbs: &[f64],
    input_ubs: &[f64],
    i: usize,
    di: usize,
) -> f64 {
    let mut val = 0.0;
    if i == di {
        val += lse_lower_bound(input_mids, input_lbs, input_ubs, i);
    }

    let ldi = input_lbs[di];
    let udi = input_ubs[di];

    let mut sum = 0.0;
    for j in 0..input_mids.len() {
        let lj = input_lbs[j];
        let uj = input_ubs[j];
        let xj = input_mids[j];
        sum += (uj - xj) / (uj - lj) * lj.exp() + (xj - lj) / (uj - lj) * uj.exp();
    }

    val -= input_mids[i].exp() / (sum * sum) * (udi.exp() - ldi.exp()) / (udi - ldi);
    val
}

fn max_mid_index(input_mids: &[f64]) -> usize {
    let mut max = f64::NEG_INFINITY;
    let mut index = 0;
    for (j, &mid) in input_mids.iter().enumerate() {
        if mid > max {
            max = mid;
            index = j;
        }
    }
    index
}

/// LSE2: the decomposition is anchored at the input with the largest
/// midpoint, which tightens the envelope when that output dominates.
pub fn lse_lower_bound2(input_mids: &[f64], input_lbs: &[f64], input_ubs: &[f64], i: usize) -> f64 {
    let star = max_mid_index(input_mids);
    if star == i {
        return er_lower_bound(input_mids, input_lbs, input_ubs, i);
    }

    let mut sum = 0.0;
    for j in 0..input_mids.len() {
        if j == star {
            sum += 1.0;
        } else {
            let ljs = input_lbs[j] - input_ubs[star];
            let ujs = input_ubs[j] - input_lbs[star];
            let xjs = input_mids[j] - input_mids[star];
            sum += (ujs - xjs) / (ujs - ljs) * ljs.exp() + (xjs - ljs) / (ujs - ljs) * ujs.exp();
        }
    }
    (input_mids[i] - input_mids[star]).exp() / sum
}

pub fn d_lse_lower_bound2(
    input_mids: &[f64],
    input_lbs: &[f64],
    input_ubs: &[f64],
    i: usize,
    di: usize,
) -> f64 {
    let star = max_mid_index(input_mids);
    if star == i {
        return d_er_lower_bound(input_mids, input_lbs, input_ubs, i, di);
    }

    let val = lse_lower_bound2(input_mids, input_lbs, input_ubs, i);

    let mut sum = 0.0;
    for j in 0..input_mids.len() {
        if j == star {
            sum += 1.0;
        } else {
            let ljs = input_lbs[j] - input_ubs[star];
            let ujs = input_ubs[j] - input_lbs[star];
            let xjs = input_mids[j] - input_mids[star];
            sum += (ujs - xjs) / (ujs - ljs) * ljs.exp() + (xjs - ljs) / (ujs - ljs) * ujs.exp();
        }
    }
    let val2 = (input_mids[i] - input_mids[star]).exp() / (sum * sum);

    if i == di {
        let ldis = input_lbs[i] - input_ubs[star];
        let udis = input_ubs[i] - input_lbs[star];
        val - val2 * (udis.exp() - ldis.exp()) / (udis - ldis)
    } else if star == di {
        let mut sum2 = 0.0;
        for j in 0..input_mids.len() {
            if j == star {
                continue;
            }
            let ljs = input_lbs[j] - input_ubs[star];
            let ujs = input_ubs[j] - input_lbs[star];
            sum2 += (ujs.exp() - ljs.exp()) / (ujs - ljs);
        }
        -val + val2 * sum2
    } else {
        let ldis = input_lbs[di] - input_ubs[star];
        let udis = input_ubs[di] - input_lbs[star];
        -val2 * (udis.exp() - ldis.exp()) / (udis - ldis)
    }
}

/// LSE upper envelope for output `i`, interpolating between the output's
/// current bounds.
pub fn lse_upper_bound(inputs: &[f64], output_lbs: &[f64], output_ubs: &[f64], i: usize) -> f64 {
    let li = output_lbs[i];
    let ui = output_ubs[i];

    let input_tilda = x_tilda(inputs, inputs[i]);

    (li * ui.ln() - ui * li.ln()) / (ui.ln() - li.ln())
        - (ui - li) / (ui.ln() - li.ln()) * log_sum_of_exponential(&input_tilda)
}

pub fn d_lse_upper_bound(
    input_mids: &[f64],
    output_lbs: &[f64],
    output_ubs: &[f64],
    i: usize,
    di: usize,
) -> f64 {
    let li = output_lbs[i];
    let ui = output_ubs[i];

    let val = -(ui - li) / (ui.ln() - li.ln());

    let mut val2 = input_mids[di].exp() / sum_of_exponential(input_mids);
    if i == di {
        val2 -= 1.0;
    }

    val * val2
}

/// ER lower envelope for output `i`.
pub fn er_lower_bound(inputs: &[f64], input_lbs: &[f64], input_ubs: &[f64], i: usize) -> f64 {
    let input_tilda = x_tilda(inputs, inputs[i]);

    let mut sum = 0.0;
    for j in 0..inputs.len() {
        if i == j {
            sum += 1.0;
        } else {
            let lj_tilda = input_lbs[j] - input_ubs[i];
            let uj_tilda = input_ubs[j] - input_lbs[i];
            let xj_tilda = input_tilda[j];
            sum += (uj_tilda - xj_tilda) / (uj_tilda - lj_tilda) * lj_tilda.exp()
                + (xj_tilda - lj_tilda) / (uj_tilda - lj_tilda) * uj_tilda.exp();
        }
    }
    1.0 / sum
}

pub fn d_er_lower_bound(
    input_mids: &[f64],
    input_lbs: &[f64],
    input_ubs: &[f64],
    i: usize,
    di: usize,
) -> f64 {
    let val = er_lower_bound(input_mids, input_lbs, input_ubs, i);

    if i != di {
        let ldi_tilda = input_lbs[di] - input_ubs[i];
        let udi_tilda = input_ubs[di] - input_lbs[i];
        -val * val * (udi_tilda.exp() - ldi_tilda.exp()) / (udi_tilda - ldi_tilda)
    } else {
        let mut val2 = 0.0;
        for j in 0..input_mids.len() {
            if j != i {
                let lj_tilda = input_lbs[j] - input_ubs[i];
                let uj_tilda = input_ubs[j] - input_lbs[i];
                val2 += (uj_tilda.exp() - lj_tilda.exp()) / (uj_tilda - lj_tilda);
            }
        }
        val * val * val2
    }
}

/// ER upper envelope for output `i`.
pub fn er_upper_bound(inputs: &[f64], output_lbs: &[f64], output_ubs: &[f64], i: usize) -> f64 {
    let li = output_lbs[i];
    let ui = output_ubs[i];

    let input_tilda = x_tilda(inputs, inputs[i]);
    ui + li - ui * li * sum_of_exponential(&input_tilda)
}

pub fn d_er_upper_bound(
    input_mids: &[f64],
    output_lbs: &[f64],
    output_ubs: &[f64],
    i: usize,
    di: usize,
) -> f64 {
    let li = output_lbs[i];
    let ui = output_ubs[i];

    if i == di {
        let mut val2 = -1.0;
        for j in 0..input_mids.len() {
            val2 += (input_mids[j] - input_mids[i]).exp();
        }
        li * ui * val2
    } else {
        -li * ui * (input_mids[di] - input_mids[i]).exp()
    }
}

/// Constant lower bound of output `i` over the box: the reciprocal of the
/// worst-case sum of exponentials.
pub fn linear_lower_bound(input_lbs: &[f64], input_ubs: &[f64], i: usize) -> f64 {
    let mut u_tilda = x_tilda(input_ubs, input_lbs[i]);
    u_tilda[i] = 0.0;
    1.0 / sum_of_exponential(&u_tilda)
}

pub fn linear_upper_bound(input_lbs: &[f64], input_ubs: &[f64], i: usize) -> f64 {
    let mut l_tilda = x_tilda(input_lbs, input_ubs[i]);
    l_tilda[i] = 0.0;
    1.0 / sum_of_exponential(&l_tilda)
}
