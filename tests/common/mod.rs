#![allow(dead_code)]

//! Hand-assembled pickle streams shaped like the ones Python's pickler and
//! joblib produce for fitted estimators.

pub const MARK: u8 = b'(';
pub const STOP: u8 = b'.';
pub const NONE: u8 = b'N';
pub const NEWTRUE: u8 = 0x88;
pub const NEWFALSE: u8 = 0x89;
pub const EMPTY_TUPLE: u8 = b')';
pub const TUPLE: u8 = b't';
pub const TUPLE1: u8 = 0x85;
pub const TUPLE2: u8 = 0x86;
pub const TUPLE3: u8 = 0x87;
pub const EMPTY_LIST: u8 = b']';
pub const APPEND: u8 = b'a';
pub const APPENDS: u8 = b'e';
pub const EMPTY_DICT: u8 = b'}';
pub const SETITEM: u8 = b's';
pub const SETITEMS: u8 = b'u';
pub const REDUCE: u8 = b'R';
pub const BUILD: u8 = b'b';
pub const NEWOBJ: u8 = 0x81;
pub const MEMOIZE: u8 = 0x94;
pub const BINGET: u8 = b'h';
pub const BINPERSID: u8 = b'Q';

pub struct PickleWriter {
    buf: Vec<u8>,
}

impl PickleWriter {
    pub fn new(protocol: u8) -> Self {
        Self {
            buf: vec![0x80, protocol],
        }
    }

    pub fn op(&mut self, opcode: u8) -> &mut Self {
        self.buf.push(opcode);
        self
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn str(&mut self, text: &str) -> &mut Self {
        if text.len() < 256 {
            self.buf.push(0x8c);
            self.buf.push(text.len() as u8);
        } else {
            self.buf.push(b'X');
            self.buf.extend_from_slice(&(text.len() as u32).to_le_bytes());
        }
        self.buf.extend_from_slice(text.as_bytes());
        self
    }

    pub fn int(&mut self, value: i64) -> &mut Self {
        if (0..256).contains(&value) {
            self.buf.push(b'K');
            self.buf.push(value as u8);
        } else if let Ok(value) = i32::try_from(value) {
            self.buf.push(b'J');
            self.buf.extend_from_slice(&value.to_le_bytes());
        } else {
            self.buf.push(0x8a);
            self.buf.push(8);
            self.buf.extend_from_slice(&value.to_le_bytes());
        }
        self
    }

    pub fn float(&mut self, value: f64) -> &mut Self {
        self.buf.push(b'G');
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn bool(&mut self, value: bool) -> &mut Self {
        self.op(if value { NEWTRUE } else { NEWFALSE })
    }

    pub fn none(&mut self) -> &mut Self {
        self.op(NONE)
    }

    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.push(b'B');
        self.buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(data);
        self
    }

    pub fn bytearray(&mut self, data: &[u8]) -> &mut Self {
        self.buf.push(0x96);
        self.buf.extend_from_slice(&(data.len() as u64).to_le_bytes());
        self.buf.extend_from_slice(data);
        self
    }

    pub fn global(&mut self, module: &str, name: &str) -> &mut Self {
        self.str(module).str(name).op(0x93)
    }

    pub fn memoize(&mut self) -> &mut Self {
        self.op(MEMOIZE)
    }

    pub fn get(&mut self, index: u8) -> &mut Self {
        self.buf.push(BINGET);
        self.buf.push(index);
        self
    }

    /// `cls.__new__(cls)` followed by a `BUILD` with the dict `attrs` writes.
    pub fn object(
        &mut self,
        module: &str,
        name: &str,
        attrs: impl FnOnce(&mut PickleWriter),
    ) -> &mut Self {
        self.global(module, name).op(EMPTY_TUPLE).op(NEWOBJ);
        self.op(EMPTY_DICT).op(MARK);
        attrs(self);
        self.op(SETITEMS).op(BUILD)
    }

    pub fn tuple_of_ints(&mut self, values: &[usize]) -> &mut Self {
        self.op(MARK);
        for value in values {
            self.int(*value as i64);
        }
        self.op(TUPLE)
    }

    /// `numpy.dtype(code, False, True)` with its state tuple; byte order is
    /// `|` where it does not apply.
    pub fn dtype(&mut self, code: &str) -> &mut Self {
        let order = if code.starts_with(['V', 'O', 'b', 'S']) { "|" } else { "<" };
        self.global("numpy", "dtype")
            .str(code)
            .bool(false)
            .bool(true)
            .op(TUPLE3)
            .op(REDUCE);
        self.op(MARK)
            .int(3)
            .str(order)
            .none()
            .none()
            .none()
            .int(-1)
            .int(-1)
            .int(0)
            .op(TUPLE)
            .op(BUILD)
    }

    /// An ndarray the way `ndarray.__reduce__` writes it.
    pub fn ndarray(&mut self, shape: &[usize], code: &str) -> &mut Self {
        self.global("numpy.core.multiarray", "_reconstruct")
            .global("numpy", "ndarray")
            .tuple_of_ints(&[0])
            .bytes(b"b")
            .op(TUPLE3)
            .op(REDUCE);
        self.op(MARK).int(1).tuple_of_ints(shape);
        self.dtype(code);
        let len: usize = shape.iter().product::<usize>() * itemsize(code);
        self.bool(false).bytes(&vec![0u8; len]).op(TUPLE).op(BUILD)
    }

    /// joblib's `NumpyArrayWrapper` followed by the raw array buffer. With
    /// `padding`, the wrapper records an alignment and the buffer is
    /// preceded by the padding length byte and that many filler bytes.
    pub fn joblib_array(&mut self, shape: &[usize], code: &str, padding: Option<u8>) -> &mut Self {
        self.object("joblib.numpy_pickle", "NumpyArrayWrapper", |w| {
            w.str("subclass").global("numpy", "ndarray");
            w.str("shape").tuple_of_ints(shape);
            w.str("order").str("C");
            w.str("dtype").dtype(code);
            w.str("allow_mmap").bool(false);
            if padding.is_some() {
                w.str("numpy_array_alignment_bytes").int(16);
            }
        });
        if let Some(padding) = padding {
            self.buf.push(padding);
            self.buf.extend(std::iter::repeat_n(0xff, usize::from(padding)));
        }
        let len: usize = shape.iter().product::<usize>() * itemsize(code);
        self.buf.extend(std::iter::repeat_n(0u8, len));
        self
    }

    /// A numpy `int64` scalar, as `numpy.core.multiarray.scalar` restores it.
    pub fn numpy_int(&mut self, value: i64) -> &mut Self {
        self.global("numpy.core.multiarray", "scalar")
            .dtype("i8")
            .bytes(&value.to_le_bytes())
            .op(TUPLE2)
            .op(REDUCE)
    }

    /// sklearn's `Tree`, reduced to `(n_features, n_classes, n_outputs)` plus
    /// a state dict whose `nodes` is a `V64` record array.
    pub fn sklearn_tree(&mut self, n_features: usize, node_count: usize) -> &mut Self {
        self.global("sklearn.tree._tree", "Tree")
            .op(MARK)
            .int(n_features as i64)
            .joblib_array(&[1], "i8", Some(2))
            .int(1)
            .op(TUPLE)
            .op(REDUCE);
        self.op(EMPTY_DICT).op(MARK);
        self.str("max_depth").int(1);
        self.str("node_count").int(node_count as i64);
        self.str("nodes").joblib_array(&[node_count], "V64", Some(4));
        self.str("values").joblib_array(&[node_count, 1, 2], "f8", Some(12));
        self.op(SETITEMS).op(BUILD)
    }

    pub fn finish(&mut self) -> Vec<u8> {
        self.buf.push(STOP);
        std::mem::take(&mut self.buf)
    }
}

fn itemsize(code: &str) -> usize {
    code.trim_start_matches(['<', '>', '|', '='])[1..]
        .parse()
        .unwrap_or(8)
}

const TREE_PARAMS: [&str; 4] = ["criterion", "max_depth", "min_samples_split", "random_state"];

fn decision_tree_params(w: &mut PickleWriter, random_state: Option<i64>) {
    w.str("criterion").str("gini");
    w.str("splitter").str("best");
    w.str("max_depth").none();
    w.str("min_samples_split").int(2);
    w.str("random_state");
    match random_state {
        Some(seed) => w.int(seed),
        None => w.none(),
    };
}

fn fitted_decision_tree(w: &mut PickleWriter, n_features: i64, seed: i64) {
    w.object("sklearn.tree._classes", "DecisionTreeClassifier", |t| {
        decision_tree_params(t, Some(seed));
        t.str("n_features_in_").int(n_features);
        t.str("n_outputs_").int(1);
        t.str("classes_").joblib_array(&[2], "f8", Some(6));
        t.str("n_classes_").numpy_int(2);
        t.str("max_features_").int(n_features);
        t.str("tree_").sklearn_tree(n_features as usize, 3);
        t.str("_sklearn_version").str("1.4.2");
    });
}

/// A fitted decision tree at the root of the artifact.
pub fn decision_tree(n_features: i64) -> Vec<u8> {
    let mut writer = PickleWriter::new(4);
    fitted_decision_tree(&mut writer, n_features, 0);
    writer.finish()
}

/// A fitted forest as `joblib.dump` writes it: the unfitted template
/// `estimator`, `estimator_params`, and two fitted trees.
pub fn random_forest(n_features: i64) -> Vec<u8> {
    PickleWriter::new(4)
        .object("sklearn.ensemble._forest", "RandomForestClassifier", |w| {
            w.str("estimator")
                .object("sklearn.tree._classes", "DecisionTreeClassifier", |t| {
                    decision_tree_params(t, None)
                });
            w.str("n_estimators").int(100);
            w.str("estimator_params").op(MARK);
            for name in TREE_PARAMS {
                w.str(name);
            }
            w.op(TUPLE);
            w.str("bootstrap").bool(true);
            w.str("criterion").str("gini");
            w.str("max_depth").none();
            w.str("n_features_in_").int(n_features);
            w.str("n_outputs_").int(1);
            w.str("classes_").joblib_array(&[2], "i8", Some(9));
            w.str("n_classes_").numpy_int(2);
            w.str("estimators_").op(EMPTY_LIST).op(MARK);
            fitted_decision_tree(w, n_features, 209_652_396);
            fitted_decision_tree(w, n_features, 398_764_591);
            w.op(APPENDS);
            w.str("_sklearn_version").str("1.4.2");
        })
        .finish()
}

pub fn linear_regression() -> Vec<u8> {
    PickleWriter::new(4)
        .object("sklearn.linear_model._base", "LinearRegression", |w| {
            w.str("fit_intercept").bool(true);
            w.str("copy_X").bool(true);
            w.str("n_jobs").none();
            w.str("positive").bool(false);
            w.str("n_features_in_").int(3);
            w.str("coef_").joblib_array(&[3], "f8", Some(4));
            w.str("intercept_").float(0.5);
            w.str("_sklearn_version").str("1.4.2");
        })
        .finish()
}

pub fn standard_scaler() -> Vec<u8> {
    PickleWriter::new(4)
        .object("sklearn.preprocessing._data", "StandardScaler", |w| {
            w.str("with_mean").bool(true);
            w.str("with_std").bool(true);
            w.str("copy").bool(true);
            w.str("n_features_in_").int(3);
            w.str("mean_").joblib_array(&[3], "f8", Some(4));
            w.str("scale_").joblib_array(&[3], "f8", Some(4));
            w.str("_sklearn_version").str("1.4.2");
        })
        .finish()
}

/// An XGBoost sklearn wrapper whose `_Booster` carries `raw` as its model
/// buffer, or no booster at all.
pub fn xgb_wrapper(class_name: &str, raw: Option<&[u8]>) -> Vec<u8> {
    PickleWriter::new(4)
        .object("xgboost.sklearn", class_name, |w| {
            w.str("n_estimators").int(2);
            w.str("max_depth").int(3);
            w.str("learning_rate").float(0.1);
            w.str("objective").str("binary:logistic");
            w.str("kwargs").op(EMPTY_DICT).op(MARK);
            w.str("tree_method").str("hist");
            w.op(SETITEMS);
            w.str("_Booster");
            match raw {
                Some(raw) => {
                    w.object("xgboost.core", "Booster", |b| {
                        b.str("handle").bytearray(raw);
                    });
                }
                None => {
                    w.none();
                }
            }
        })
        .finish()
}

/// Booster JSON as `save_raw` writes it: three input features and two trees
/// splitting on features 0, 2 and 0 again.
pub fn booster_json(feature_names: Option<&[&str]>) -> String {
    let names = match feature_names {
        Some(names) => format!(
            "[{}]",
            names
                .iter()
                .map(|name| format!("\"{name}\""))
                .collect::<Vec<_>>()
                .join(",")
        ),
        None => "[]".to_string(),
    };
    format!(
        r#"{{"learner":{{"feature_names":{names},"learner_model_param":{{"base_score":"5E-1","num_class":"0","num_feature":"3","num_target":"1"}},"gradient_booster":{{"name":"gbtree","model":{{"trees":[
{{"split_indices":[0,0,0],"left_children":[1,-1,-1],"loss_changes":[4.0,0.0,0.0],"sum_hessian":[10.0,6.0,4.0]}},
{{"split_indices":[2,0,0,0,0],"left_children":[1,3,-1,-1,-1],"loss_changes":[2.0,1.0,0.0,0.0,0.0],"sum_hessian":[8.0,5.0,3.0,2.0,3.0]}}
]}}}}}}}}"#
    )
}

/// The memory snapshot a pickled `Booster` keeps in its `handle`: the
/// training configuration next to the model itself.
pub fn booster_snapshot(feature_names: Option<&[&str]>) -> String {
    format!(
        r#"{{"Config":{{"learner":{{"learner_train_param":{{"booster":"gbtree","objective":"binary:logistic"}}}},"version":[2,0,3]}},"Model":{}}}"#,
        booster_json(feature_names)
    )
}
