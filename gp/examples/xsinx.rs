use gpal_gp::{ExactGp, Kernel, McmcConfig};
use ndarray::{arr2, Array, Array1, Axis};

fn xsinx(x: &Array1<f64>) -> Array1<f64> {
    x.mapv(|v| (v - 3.5) * ((v - 3.5) / std::f64::consts::PI).sin())
}

fn main() {
    env_logger::init();

    let xt = arr2(&[[0.0], [5.0], [10.0], [15.0], [18.0], [20.0], [25.0]]);
    let yt = xsinx(&xt.column(0).to_owned());

    println!("Sample GP posterior of 'xsinx' observed at {}", xt.column(0));
    let gp = ExactGp::params(Kernel::Rbf, 1)
        .fit(
            42,
            &xt.view(),
            &yt.view(),
            &McmcConfig {
                num_chains: 2,
                num_warmup: 300,
                num_samples: 300,
            },
        )
        .expect("GP fitting");

    for stats in gp.chain_stats() {
        println!(
            "chain: acceptance {:.2}, {} divergences",
            stats.accept_rate, stats.divergences
        );
    }

    let xtest = Array::linspace(0., 25., 26).insert_axis(Axis(1));
    let ytest = xsinx(&xtest.column(0).to_owned());
    let pred = gp.predict(7, &xtest.view()).expect("GP prediction");
    let (_, var) = gp
        .posterior_moments(&xtest.view())
        .expect("GP prediction");

    println!("x, err(x), sigma(x)");
    for i in 0..xtest.nrows() {
        println!(
            "{:5.1} {:8.4} {:8.4}",
            xtest[[i, 0]],
            pred.point[i] - ytest[i],
            var[i].sqrt()
        );
    }
}
